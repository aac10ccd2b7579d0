use std::path::PathBuf;
use std::time::Duration;

/// Tunable constants of a node. `Default` gives the standard values.
#[derive(Debug, Clone)]
pub struct KadConfig {
    /// Bucket capacity and the size of a lookup's final result set.
    pub k: usize,
    /// Maximum parallel in-flight requests per lookup (alpha).
    pub concurrency: usize,
    /// Per-request reply deadline and the lookup no-progress window.
    pub operation_timeout: Duration,
    /// Period of the background refresh task.
    pub restore_interval: Duration,
    /// Write the snapshot files on shutdown.
    pub save_state_on_shutdown: bool,
    /// Override the snapshot root; `None` means `$HOME`.
    pub state_root: Option<PathBuf>,
}

impl Default for KadConfig {
    fn default() -> Self {
        Self {
            k: 5,
            concurrency: 3,
            operation_timeout: Duration::from_secs(2),
            restore_interval: Duration::from_secs(60 * 60),
            save_state_on_shutdown: true,
            state_root: None,
        }
    }
}
