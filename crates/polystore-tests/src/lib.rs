//! Polystore test infrastructure: fault-injecting backends and store
//! construction helpers shared by the integration suites.

pub mod harness;

pub use harness::{init_tracing, FlakyBackend, UnavailableBackend};
