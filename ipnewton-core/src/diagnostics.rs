//! Env-gated iteration diagnostics.
//!
//! Set `IPNEWTON_DEBUG=1` to print one line per iteration to stderr, and
//! `IPNEWTON_DEBUG_EVERY=k` to thin the output.

use std::env;

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub every: usize,
}

impl DiagnosticsConfig {
    pub fn from_env() -> Self {
        let enabled = match env::var("IPNEWTON_DEBUG") {
            Ok(v) => v != "0" && v.to_lowercase() != "false",
            Err(_) => false,
        };

        let every = env::var("IPNEWTON_DEBUG_EVERY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(1);

        Self { enabled, every }
    }

    #[inline]
    pub fn should_log(&self, iter: usize) -> bool {
        self.enabled && (iter % self.every == 0)
    }
}
