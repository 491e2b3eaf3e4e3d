//! Uhr auf Basis der Tokio-Zeit
//!
//! Folgt `tokio::time::pause()`, damit Puffer-Fristen und Haltezeiten in
//! Tests mit virtueller Zeit laufen.

use huddle_core::Clock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn jetzt(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}
