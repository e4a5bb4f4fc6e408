use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: all interfaces, port 8000).
    pub bind_addr: SocketAddr,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Largest accepted request body in bytes; two photos in base64 are big.
    pub max_body_bytes: usize,
    /// Pending comparisons the engine queue holds before callers wait.
    pub queue_depth: usize,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = lookup("FACEMATCH_BIND_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_bind_addr);

        let model_dir = lookup("FACEMATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(facematch_core::default_model_dir);

        Self {
            bind_addr,
            model_dir,
            max_body_bytes: parse_or(&lookup, "FACEMATCH_MAX_BODY_BYTES", 32 * 1024 * 1024),
            queue_depth: parse_or(&lookup, "FACEMATCH_QUEUE_DEPTH", 16).max(1),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    DEFAULT_BIND_ADDR
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8000)))
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
