//! Version information for funcbridge.

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Worker version reported to the host in the worker-init response.
pub const WORKER_VERSION: &str = "1.0.0.2";

/// Versions logged at startup.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub bridge: &'static str,
    pub worker: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            worker: WORKER_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
