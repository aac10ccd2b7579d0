pub mod config;
pub mod core;
pub mod error;
pub mod node;
pub mod protocol;
mod snapshot;

// Re-export commonly used types for consumers and integration tests
pub use crate::config::KadConfig;
pub use crate::core::identifier::{Contact, KadId, Key};
pub use crate::core::storage::{Content, GetParameter};
pub use crate::error::KadError;
pub use crate::node::Kad;

use ctor::ctor;
use tracing_subscriber::{fmt, EnvFilter};

#[ctor]
fn init_tracing() {
    // Avoid duplicate initialization if multiple tests run in parallel
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_target(false)
        .compact()
        .try_init();
}
