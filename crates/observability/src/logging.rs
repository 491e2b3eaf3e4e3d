//! Structured Logging via tracing-subscriber
//!
//! Umgebungsvariablen haben Vorrang vor der Konfigurationsdatei:
//! - `HUDDLE_LOG_LEVEL`: EnvFilter-Ausdruck, z.B. `info` oder `huddle_voice=debug`
//! - `HUDDLE_LOG_FORMAT`: `text` oder `json`
//!
//! Raum- und Teilnehmer-IDs laufen als strukturierte Felder (`room`, `peer`,
//! `user`) durch, damit JSON-Logs je Sitzung filterbar sind.

use tracing_subscriber::{fmt, EnvFilter};

pub const LEVEL_ENV: &str = "HUDDLE_LOG_LEVEL";
pub const FORMAT_ENV: &str = "HUDDLE_LOG_FORMAT";

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Ausgabeformat der Logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Unbekannte Werte fallen auf `Text` zurueck
    pub fn aus_str(wert: &str) -> Self {
        match wert {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Initialisiert das Logging; ein zweiter Aufruf ist wirkungslos
pub fn logging_initialisieren(level: &str, format: &str) {
    let filter = EnvFilter::try_from_env(LEVEL_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let format = std::env::var(FORMAT_ENV)
        .map(|f| LogFormat::aus_str(&f))
        .unwrap_or_else(|_| LogFormat::aus_str(format));

    let ergebnis = match format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_thread_ids(true)
            .try_init(),
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init(),
    };
    if ergebnis.is_err() {
        tracing::debug!("Logging war bereits initialisiert");
    }
}

/// Einfache Level-Namen, wie sie in der Konfigurationsdatei stehen
pub fn log_level_gueltig(level: &str) -> bool {
    LEVELS.contains(&level)
}

pub fn log_format_gueltig(format: &str) -> bool {
    matches!(format, "text" | "json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_nur_kleingeschrieben() {
        for level in LEVELS {
            assert!(log_level_gueltig(level));
        }
        assert!(!log_level_gueltig("INFO"));
        assert!(!log_level_gueltig("verbose"));
        assert!(!log_level_gueltig(""));
    }

    #[test]
    fn format_text_oder_json() {
        assert!(log_format_gueltig("json"));
        assert!(!log_format_gueltig("xml"));
        assert_eq!(LogFormat::aus_str("json"), LogFormat::Json);
        assert_eq!(LogFormat::aus_str("irgendwas"), LogFormat::Text);
    }

    #[test]
    fn doppelte_initialisierung_ist_harmlos() {
        logging_initialisieren("warn", "text");
        logging_initialisieren("debug", "json");
    }
}
