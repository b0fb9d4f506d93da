//! Input rules that drop, rename or retype samples before aggregation.
//!
//! Rules are configured as text, one rule per line:
//!
//! ```text
//! condition => target
//! ```
//!
//! Rules are applied in order. Every rule sees the samples produced by the previous rule; samples
//! that do not match the condition pass through unchanged. Empty lines and lines starting with `#`
//! are ignored.
//!
//! # Conditions
//!
//! - `any`: matches all samples.
//! - `metric_type <type>+`: matches samples of any of the listed types (`c`, `g`, `ms`).
//! - `path_like <glob>`: matches the metric name against a glob pattern.
//! - `not <condition>`: negates another condition.
//!
//! # Targets
//!
//! - `drop`: discards the sample.
//! - `rewrite <regex> <replacement> [dup]`: replaces all matches of the regex in the name. The
//!   replacement may refer to capture groups as `$1` or `${name}`.
//! - `set_metric_type <type> [dup]`: changes the metric type.
//!
//! With `dup`, the original sample is kept in addition to the changed one.
//!
//! # Example
//!
//! ```
//! use statsrelay_metrics::rules::Rules;
//! use statsrelay_metrics::{MetricKind, Sample};
//!
//! let rules: Rules = "path_like debug.* => drop\n\
//!                     any => rewrite ^app\\. service."
//!     .parse()
//!     .unwrap();
//!
//! let samples = rules.apply(Sample::new("app.hits", 1.0, MetricKind::Counter));
//! assert_eq!(samples[0].name, "service.hits");
//! assert!(rules.apply(Sample::new("debug.x", 1.0, MetricKind::Counter)).is_empty());
//! ```

use std::fmt;
use std::str::FromStr;

use globset::{Glob, GlobMatcher};
use regex::Regex;
use smallvec::{SmallVec, smallvec};

use crate::{MetricKind, Sample};

/// An error raised while parsing [`Rules`].
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The line does not contain a `=>` separator.
    #[error("rule {line} is missing the `=>` separator")]
    MissingSeparator {
        /// One-based line number of the rule.
        line: usize,
    },
    /// The condition name is not known.
    #[error("unknown condition `{0}`")]
    UnknownCondition(String),
    /// The target name is not known.
    #[error("unknown target `{0}`")]
    UnknownTarget(String),
    /// A condition or target is missing a required argument.
    #[error("`{0}` is missing an argument")]
    MissingArgument(&'static str),
    /// A condition or target has trailing arguments.
    #[error("unexpected argument `{0}`")]
    UnexpectedArgument(String),
    /// A metric type is not one of `c`, `g` or `ms`.
    #[error("invalid metric type `{0}`")]
    InvalidKind(String),
    /// The glob of a `path_like` condition is invalid.
    #[error("invalid glob pattern")]
    InvalidGlob(#[from] globset::Error),
    /// The regex of a `rewrite` target is invalid.
    #[error("invalid rewrite pattern")]
    InvalidRegex(#[from] regex::Error),
}

enum Condition {
    Any,
    MetricType(Vec<MetricKind>),
    PathLike(GlobMatcher),
    Not(Box<Condition>),
}

impl Condition {
    fn parse(parts: &[&str]) -> Result<Self, RuleError> {
        let Some((&name, args)) = parts.split_first() else {
            return Err(RuleError::MissingArgument("condition"));
        };

        Ok(match name {
            "any" => {
                expect_no_args(args)?;
                Self::Any
            }
            "metric_type" => {
                if args.is_empty() {
                    return Err(RuleError::MissingArgument("metric_type"));
                }
                let kinds = args
                    .iter()
                    .map(|kind| parse_kind(kind))
                    .collect::<Result<_, _>>()?;
                Self::MetricType(kinds)
            }
            "path_like" => match args {
                [pattern] => Self::PathLike(Glob::new(pattern)?.compile_matcher()),
                [] => return Err(RuleError::MissingArgument("path_like")),
                [_, extra, ..] => return Err(RuleError::UnexpectedArgument((*extra).to_owned())),
            },
            "not" => Self::Not(Box::new(Self::parse(args)?)),
            other => return Err(RuleError::UnknownCondition(other.to_owned())),
        })
    }

    fn matches(&self, sample: &Sample) -> bool {
        match self {
            Self::Any => true,
            Self::MetricType(kinds) => kinds.contains(&sample.kind),
            Self::PathLike(matcher) => matcher.is_match(&sample.name),
            Self::Not(inner) => !inner.matches(sample),
        }
    }
}

enum Target {
    Drop,
    Rewrite {
        pattern: Regex,
        replacement: String,
        dup: bool,
    },
    SetMetricType {
        kind: MetricKind,
        dup: bool,
    },
}

impl Target {
    fn parse(parts: &[&str]) -> Result<Self, RuleError> {
        let Some((&name, args)) = parts.split_first() else {
            return Err(RuleError::MissingArgument("target"));
        };

        Ok(match name {
            "drop" => {
                expect_no_args(args)?;
                Self::Drop
            }
            "rewrite" => match args {
                [pattern, replacement, rest @ ..] => Self::Rewrite {
                    pattern: Regex::new(pattern)?,
                    replacement: (*replacement).to_owned(),
                    dup: parse_dup(rest)?,
                },
                _ => return Err(RuleError::MissingArgument("rewrite")),
            },
            "set_metric_type" => match args {
                [kind, rest @ ..] => Self::SetMetricType {
                    kind: parse_kind(kind)?,
                    dup: parse_dup(rest)?,
                },
                [] => return Err(RuleError::MissingArgument("set_metric_type")),
            },
            other => return Err(RuleError::UnknownTarget(other.to_owned())),
        })
    }

    fn apply(&self, sample: Sample, output: &mut SmallVec<[Sample; 2]>) {
        match self {
            Self::Drop => (),
            Self::Rewrite {
                pattern,
                replacement,
                dup,
            } => {
                if *dup && pattern.is_match(&sample.name) {
                    output.push(sample.clone());
                }
                let name = pattern
                    .replace_all(&sample.name, replacement.as_str())
                    .into_owned();
                output.push(Sample { name, ..sample });
            }
            Self::SetMetricType { kind, dup } => {
                if *dup {
                    output.push(sample.clone());
                }
                output.push(Sample {
                    kind: *kind,
                    ..sample
                });
            }
        }
    }
}

fn parse_kind(kind: &str) -> Result<MetricKind, RuleError> {
    kind.parse()
        .map_err(|_| RuleError::InvalidKind(kind.to_owned()))
}

fn parse_dup(args: &[&str]) -> Result<bool, RuleError> {
    match args {
        [] => Ok(false),
        ["dup"] => Ok(true),
        ["no-dup"] => Ok(false),
        [other, ..] => Err(RuleError::UnexpectedArgument((*other).to_owned())),
    }
}

fn expect_no_args(args: &[&str]) -> Result<(), RuleError> {
    match args.first() {
        Some(arg) => Err(RuleError::UnexpectedArgument((*arg).to_owned())),
        None => Ok(()),
    }
}

struct Rule {
    condition: Condition,
    target: Target,
}

/// An ordered list of input rules.
///
/// See the [module documentation](self) for the rule syntax.
#[derive(Default)]
pub struct Rules {
    rules: Vec<Rule>,
}

impl Rules {
    /// Returns `true` if there are no rules, in which case samples pass unchanged.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Applies all rules in order and returns the resulting samples.
    pub fn apply(&self, sample: Sample) -> SmallVec<[Sample; 2]> {
        let mut samples: SmallVec<[Sample; 2]> = smallvec![sample];

        for rule in &self.rules {
            if samples.is_empty() {
                break;
            }

            let pending = std::mem::take(&mut samples);
            for sample in pending {
                if rule.condition.matches(&sample) {
                    rule.target.apply(sample, &mut samples);
                } else {
                    samples.push(sample);
                }
            }
        }

        samples
    }
}

impl FromStr for Rules {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules = Vec::new();

        for (index, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (condition, target) = line
                .split_once("=>")
                .ok_or(RuleError::MissingSeparator { line: index + 1 })?;

            let condition_parts: Vec<_> = condition.split_whitespace().collect();
            let target_parts: Vec<_> = target.split_whitespace().collect();

            rules.push(Rule {
                condition: Condition::parse(&condition_parts)?,
                target: Target::parse(&target_parts)?,
            });
        }

        Ok(Self { rules })
    }
}

impl fmt::Debug for Rules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rules")
            .field("len", &self.rules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn names(samples: &[Sample]) -> Vec<(&str, MetricKind)> {
        samples.iter().map(|s| (s.name.as_str(), s.kind)).collect()
    }

    fn counter(name: &str) -> Sample {
        Sample::new(name, 1.0, MetricKind::Counter)
    }

    #[test]
    fn test_empty_rules_pass_through() {
        let rules: Rules = "\n# nothing here\n".parse().unwrap();
        assert!(rules.is_empty());
        assert_eq!(rules.apply(counter("foo")).as_slice(), [counter("foo")]);
    }

    #[test]
    fn test_drop_by_type() {
        let rules: Rules = "metric_type g ms => drop".parse().unwrap();

        assert!(rules.apply(Sample::new("a", 1.0, MetricKind::Gauge)).is_empty());
        assert!(rules.apply(Sample::new("a", 1.0, MetricKind::Timer)).is_empty());
        assert_eq!(rules.apply(counter("a")).len(), 1);
    }

    #[test]
    fn test_not_condition() {
        let rules: Rules = "not path_like web.* => drop".parse().unwrap();

        assert!(rules.apply(counter("db.hits")).is_empty());
        assert_eq!(rules.apply(counter("web.hits")).len(), 1);
    }

    #[test]
    fn test_rewrite_with_dup() {
        let rules: Rules = r"path_like app.* => rewrite ^app\.(\w+) svc.$1 dup"
            .parse()
            .unwrap();

        let samples = rules.apply(counter("app.hits"));
        assert_eq!(
            names(&samples),
            [
                ("app.hits", MetricKind::Counter),
                ("svc.hits", MetricKind::Counter)
            ]
        );
    }

    #[test]
    fn test_rules_chain() {
        let rules: Rules = "\
            any => set_metric_type g dup
            metric_type c => rewrite $ .count
            path_like *.count => drop
        "
        .parse()
        .unwrap();

        let samples = rules.apply(counter("hits"));
        assert_eq!(names(&samples), [("hits", MetricKind::Gauge)]);
    }

    #[test]
    fn test_parse_errors() {
        let error = "any drop".parse::<Rules>().unwrap_err();
        assert_eq!(error.to_string(), "rule 1 is missing the `=>` separator");

        let error = "sometimes => drop".parse::<Rules>().unwrap_err();
        assert_eq!(error.to_string(), "unknown condition `sometimes`");

        let error = "any => redirect host 8125".parse::<Rules>().unwrap_err();
        assert_eq!(error.to_string(), "unknown target `redirect`");

        let error = "metric_type x => drop".parse::<Rules>().unwrap_err();
        assert_eq!(error.to_string(), "invalid metric type `x`");

        assert!(matches!(
            "any => rewrite ( x".parse::<Rules>(),
            Err(RuleError::InvalidRegex(_))
        ));
        assert!(matches!(
            "any => drop now".parse::<Rules>(),
            Err(RuleError::UnexpectedArgument(_))
        ));
    }
}
