use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings shared by the store context and the page contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlossmarkConfig {
    /// Snapshot file for the word store. `None` keeps records in memory only.
    pub data_path: Option<PathBuf>,
    pub hide_delay_ms: u64,
    /// Delay before the single retry when a page is not ready on first init.
    pub reinit_delay_ms: u64,
    pub request_capacity: usize,
    pub event_capacity: usize,
}

impl Default for GlossmarkConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            hide_delay_ms: 300,
            reinit_delay_ms: 1_000,
            request_capacity: 64,
            event_capacity: 16,
        }
    }
}

impl GlossmarkConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn hide_delay(&self) -> Duration {
        Duration::from_millis(self.hide_delay_ms)
    }

    pub fn reinit_delay(&self) -> Duration {
        Duration::from_millis(self.reinit_delay_ms)
    }
}
