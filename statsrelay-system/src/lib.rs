//! Foundational system components for statsrelay's services.
//!
//! Services are long running tasks that receive messages through an [`Addr`] and handle them one
//! by one in their [`Service::run`] loop. Shutdown is coordinated through the [`Controller`].
#![warn(missing_docs)]

mod backoff;
mod controller;
mod service;

pub use self::backoff::*;
pub use self::controller::*;
pub use self::service::*;
