use std::fmt;

use crate::DestinationNode;

/// Default number of virtual replicas placed on the ring per destination node.
pub const DEFAULT_REPLICAS: usize = 1024;

/// Returns the position of a key on the ring.
///
/// The position is the first four bytes of the key's MD5 digest, read as a big-endian integer.
pub fn ring_position(key: &[u8]) -> u32 {
    let digest = md5::compute(key);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// A consistent hash ring over a set of [`DestinationNode`]s.
///
/// Every node occupies `replicas` positions on a 32-bit ring, derived from the keys
/// `"{node}:{i}"`. A metric name is owned by the first node position at or clockwise after the
/// position of the name, wrapping around at the end of the ring.
///
/// Rings are immutable. To change the node set, build a new ring; with enough replicas only a
/// fraction of about `1/N` of all names moves to a different node when one of `N` nodes is added
/// or removed.
#[derive(Clone)]
pub struct HashRing {
    nodes: Vec<DestinationNode>,
    entries: Vec<(u32, usize)>,
    replicas: usize,
}

impl HashRing {
    /// Builds a ring from a list of nodes.
    ///
    /// Duplicate nodes are collapsed. Returns `None` if the list is empty or `replicas` is zero.
    pub fn new(nodes: impl IntoIterator<Item = DestinationNode>, replicas: usize) -> Option<Self> {
        let mut nodes: Vec<_> = nodes.into_iter().collect();
        nodes.sort_unstable();
        nodes.dedup();

        if nodes.is_empty() || replicas == 0 {
            return None;
        }

        let mut entries = Vec::with_capacity(nodes.len() * replicas);
        for (index, node) in nodes.iter().enumerate() {
            for replica in 0..replicas {
                let key = format!("{node}:{replica}");
                entries.push((ring_position(key.as_bytes()), index));
            }
        }

        // Colliding positions are resolved by node order, which keeps lookups deterministic.
        entries.sort_unstable();

        Some(Self {
            nodes,
            entries,
            replicas,
        })
    }

    /// Returns the sorted, deduplicated nodes of this ring.
    pub fn nodes(&self) -> &[DestinationNode] {
        &self.nodes
    }

    /// The number of virtual replicas per node.
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Returns the index into [`nodes`](Self::nodes) of the node owning `key`.
    pub fn node_index(&self, key: &str) -> usize {
        self.entries[self.start(key)].1
    }

    /// Returns the node owning `key`.
    pub fn get_node(&self, key: &str) -> &DestinationNode {
        &self.nodes[self.node_index(key)]
    }

    /// Returns the indexes of up to `count` distinct nodes for `key`, in ring order.
    ///
    /// The first index is always the owner returned by [`node_index`](Self::node_index).
    pub fn node_indices(&self, key: &str, count: usize) -> Vec<usize> {
        let count = count.min(self.nodes.len());
        let mut indices = Vec::with_capacity(count);

        let start = self.start(key);
        let len = self.entries.len();
        for offset in 0..len {
            if indices.len() == count {
                break;
            }

            let (_, index) = self.entries[(start + offset) % len];
            if !indices.contains(&index) {
                indices.push(index);
            }
        }

        indices
    }

    /// Returns up to `count` distinct nodes for `key`, in ring order.
    pub fn get_nodes(&self, key: &str, count: usize) -> Vec<&DestinationNode> {
        self.node_indices(key, count)
            .into_iter()
            .map(|index| &self.nodes[index])
            .collect()
    }

    fn start(&self, key: &str) -> usize {
        let position = ring_position(key.as_bytes());
        self.entries.partition_point(|(p, _)| *p < position) % self.entries.len()
    }
}

impl fmt::Debug for HashRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashRing")
            .field("nodes", &self.nodes)
            .field("replicas", &self.replicas)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;
    use rand::distr::Alphanumeric;
    use similar_asserts::assert_eq;

    use super::*;

    fn nodes(count: usize) -> Vec<DestinationNode> {
        (0..count)
            .map(|i| DestinationNode::new(format!("carbon-{i}"), 2004))
            .collect()
    }

    fn random_names(count: usize) -> Vec<String> {
        let mut rng = rand::rng();
        (0..count)
            .map(|_| {
                let len = rng.random_range(5..40);
                (&mut rng)
                    .sample_iter(Alphanumeric)
                    .take(len)
                    .map(char::from)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_ring_position() {
        // md5("a") = 0cc175b9c0f1b6a831c399e269772661
        assert_eq!(ring_position(b"a"), 0x0cc175b9);
    }

    #[test]
    fn test_empty_ring() {
        assert!(HashRing::new(Vec::new(), DEFAULT_REPLICAS).is_none());
        assert!(HashRing::new(nodes(2), 0).is_none());
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = HashRing::new(nodes(1), 16).unwrap();
        for name in random_names(100) {
            assert_eq!(ring.get_node(&name).host(), "carbon-0");
        }
    }

    #[test]
    fn test_duplicate_nodes_collapse() {
        let mut list = nodes(2);
        list.extend(nodes(2));
        let ring = HashRing::new(list, 8).unwrap();
        assert_eq!(ring.nodes().len(), 2);
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let ring = HashRing::new(nodes(5), DEFAULT_REPLICAS).unwrap();
        let rebuilt = HashRing::new(nodes(5).into_iter().rev(), DEFAULT_REPLICAS).unwrap();

        for name in random_names(1000) {
            let node = ring.get_node(&name);
            assert_eq!(ring.get_node(&name), node);
            assert_eq!(rebuilt.get_node(&name), node);
        }
    }

    #[test]
    fn test_get_nodes_distinct() {
        let ring = HashRing::new(nodes(3), 64).unwrap();

        for name in random_names(100) {
            let selected = ring.get_nodes(&name, 2);
            assert_eq!(selected.len(), 2);
            assert_ne!(selected[0], selected[1]);
            assert_eq!(selected[0], ring.get_node(&name));
        }

        assert_eq!(ring.get_nodes("foo", 10).len(), 3);
    }

    #[test]
    fn test_adding_node_remaps_bounded_fraction() {
        let names = random_names(10_000);
        let before = HashRing::new(nodes(4), DEFAULT_REPLICAS).unwrap();
        let after = HashRing::new(nodes(5), DEFAULT_REPLICAS).unwrap();

        let moved = names
            .iter()
            .filter(|name| before.get_node(name) != after.get_node(name))
            .count();

        // Expected fraction is 1/5. Allow generous slack for the random sample.
        assert!(moved < names.len() * 3 / 10, "moved {moved} names");

        // Names only ever move to the new node.
        for name in &names {
            let node = after.get_node(name);
            if before.get_node(name) != node {
                assert_eq!(node.host(), "carbon-4");
            }
        }
    }

    #[test]
    fn test_removing_node_remaps_only_its_names() {
        let names = random_names(10_000);
        let before = HashRing::new(nodes(4), DEFAULT_REPLICAS).unwrap();
        let after = HashRing::new(nodes(3), DEFAULT_REPLICAS).unwrap();

        for name in &names {
            let old = before.get_node(name);
            if old.host() != "carbon-3" {
                assert_eq!(after.get_node(name), old);
            }
        }
    }

    #[test]
    fn test_distribution_is_balanced() {
        let ring = HashRing::new(nodes(4), DEFAULT_REPLICAS).unwrap();
        let mut counts = [0usize; 4];
        for name in random_names(20_000) {
            counts[ring.node_index(&name)] += 1;
        }

        for count in counts {
            assert!((3_000..7_000).contains(&count), "unbalanced: {counts:?}");
        }
    }
}
