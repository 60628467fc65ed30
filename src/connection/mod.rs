//! Link management
//!
//! This module handles:
//! - Bringing the link driver up and probing reachability
//! - Retry with linear backoff after every disconnection
//! - Clock sync and session bring-up once the link is connected

mod driver;
mod manager;

pub use driver::HostLinkDriver;
pub use manager::{EstablishedSignal, LinkManager};
