use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    pub fn from_env() -> Self {
        Self::parse(env::var("ENVIRONMENT").ok().as_deref())
    }

    /// Anything other than `production`/`prod` (case-insensitive) is development.
    pub fn parse(value: Option<&str>) -> Self {
        match value.unwrap_or("development").to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

/// Logging and telemetry settings shared by every binary of the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub environment: Environment,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_level: String,
    pub otel_endpoint: Option<String>,
}

impl ObservabilityConfig {
    /// Reads `ENVIRONMENT`, `LOG_LEVEL` and `OTEL_EXPORTER_OTLP_ENDPOINT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            environment: Environment::parse(lookup("ENVIRONMENT").as_deref()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            otel_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|e| !e.is_empty()),
        }
    }
}
