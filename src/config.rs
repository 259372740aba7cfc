//! Runtime-configurable parameters for the P2P reduction coordinator.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `MESHREDUCE_`) or by constructing a custom `MeshReduceConfig`.

/// Tuning and policy parameters applied at coordinator construction.
#[derive(Debug, Clone)]
pub struct MeshReduceConfig {
    /// Global ceiling on the payload size admitted to the P2P path.
    pub max_size_bytes: usize,

    /// Trust the driver's peer-access report instead of running the
    /// authoritative per-pair verification. Escape hatch for platforms
    /// where the verification is known-slow and the driver is trusted;
    /// off by default.
    pub skip_p2p_check: bool,
}

impl Default for MeshReduceConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 8192 * 1024, // 8 MiB
            skip_p2p_check: false,
        }
    }
}

impl MeshReduceConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `MESHREDUCE_MAX_SIZE_BYTES`
    /// - `MESHREDUCE_SKIP_P2P_CHECK` ("1" or "true")
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("MESHREDUCE_MAX_SIZE_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_size_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("MESHREDUCE_SKIP_P2P_CHECK") {
            cfg.skip_p2p_check = v == "1" || v.eq_ignore_ascii_case("true");
        }

        cfg
    }
}
