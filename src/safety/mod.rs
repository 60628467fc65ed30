//! Connectivity supervision
//!
//! Waits for the node to become established after boot and restarts the
//! process when that does not happen in time.

mod supervisor;

pub use supervisor::{ConnectivitySupervisor, ProcessRestarter, SupervisorOutcome};
