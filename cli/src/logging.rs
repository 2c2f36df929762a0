//! Tracing subscriber setup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-crate override, e.g. `chainstream-core` → `debug`
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_level(), components: HashMap::new(), json: false }
    }
}

impl LogConfig {
    /// Parse `crate=level` pairs; malformed pairs are skipped.
    pub fn with_overrides<'a>(mut self, pairs: impl IntoIterator<Item = &'a str>) -> Self {
        for pair in pairs {
            if let Some((component, level)) = pair.split_once('=') {
                self.components.insert(component.trim().to_string(), level.trim().to_string());
            }
        }
        self
    }

    /// `EnvFilter` directive string, e.g. `info,chainstream_core=debug`.
    pub fn directives(&self) -> String {
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        let mut directives = self.level.clone();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
    }
}
