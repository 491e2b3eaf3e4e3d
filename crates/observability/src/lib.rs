//! # huddle-observability
//!
//! Observability-Crate fuer huddle:
//! - Prometheus-kompatible Voice-Metriken (Textformat via [`VoiceMetrics::exportieren`])
//! - Structured Logging via tracing-subscriber (Text oder JSON)

pub mod logging;
pub mod metrics;

pub use logging::logging_initialisieren;
pub use metrics::VoiceMetrics;
