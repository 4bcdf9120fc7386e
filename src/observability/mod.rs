//! Observability: tracing subscriber setup and span macros

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

pub use logging::{auth_span, command_span, mqtt_span, pool_span};
