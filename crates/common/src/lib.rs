pub mod config;
pub mod logging;
pub mod telemetry;

pub use config::{Environment, ObservabilityConfig};
pub use logging::setup_logging;
pub use telemetry::TelemetryGuard;
