//! scour-harness: in-memory implementations of every scour port plus a
//! whole-cluster simulator for integration testing.

pub mod memdb;
pub mod sim;
pub mod sink;
pub mod transport;
pub mod world;

pub use memdb::MemSysDb;
pub use sim::SimCluster;
pub use sink::CapturingSink;
pub use transport::MemCluster;
pub use world::{SimMgmt, SimPool, SimPoolStore, SimShard, SimWorld};

/// Initialise tracing for tests; safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,scour_check=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
