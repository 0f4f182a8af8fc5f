use std::fmt;

/// Build metadata baked in at compile time.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: String,
    pub build_timestamp: String,
    pub build_features: String,
}

impl BuildInfo {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_timestamp: option_env!("BUILD_TIMESTAMP")
                .unwrap_or("unknown")
                .to_string(),
            build_features: option_env!("BUILD_FEATURES").unwrap_or("none").to_string(),
        }
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (built {}, features: {})",
            self.version, self.build_timestamp, self.build_features
        )
    }
}
