//! Injizierbare Uhr
//!
//! Zeitabhaengige Zustandsmaschinen (Sprecher-Erkennung, Jitter-Puffer)
//! fragen die Zeit nie direkt ab, sondern ueber [`Clock`]. Tests koennen so
//! mit [`ManualClock`] deterministisch vorspulen.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Zeitquelle
pub trait Clock: Send + Sync + 'static {
    fn jetzt(&self) -> Instant;
}

/// Systemuhr (monoton)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn jetzt(&self) -> Instant {
        Instant::now()
    }
}

/// Manuell gesteuerte Uhr fuer Tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    aktuell: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn neu() -> Self {
        Self {
            aktuell: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Spult die Uhr um `dauer` vor
    pub fn vorspulen(&self, dauer: Duration) {
        *self.aktuell.lock() += dauer;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::neu()
    }
}

impl Clock for ManualClock {
    fn jetzt(&self) -> Instant {
        *self.aktuell.lock()
    }
}
