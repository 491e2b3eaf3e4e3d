//! Sprecher-Erkennung mit Hysterese
//!
//! ```text
//! Still -> Steigend(n) -> Spricht -> Abklingend(frist) -> Still
//!   ^          |                        |
//!   +----------+ (unter Schwelle)       +-> Spricht (wieder ueber Schwelle)
//! ```
//!
//! Lokal wird pro Tick der Pegel des Analyse-Abgriffs ausgewertet; fuer
//! entfernte Teilnehmer spiegelt [`SpeakingDetector::setzen`] die
//! `user-speaking`-Nachrichten in dieselbe Zustandsform.

use huddle_core::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Parameter der Sprecher-Erkennung
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Abtastintervall in Millisekunden
    pub tick_ms: u64,
    /// RMS-Schwelle (linear, 0.0..1.0)
    pub schwelle: f32,
    /// Aufeinanderfolgende Ticks ueber der Schwelle bis "spricht"
    pub frames: u32,
    /// Haltezeit nach dem Absinken in Millisekunden
    pub halten_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 33,
            schwelle: 0.02,
            frames: 3,
            halten_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SprechZustand {
    Still,
    Steigend(u32),
    Spricht,
    Abklingend(Instant),
}

pub struct SpeakingDetector {
    config: DetectorConfig,
    zustand: SprechZustand,
    clock: Arc<dyn Clock>,
}

impl SpeakingDetector {
    pub fn neu(config: DetectorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            zustand: SprechZustand::Still,
            clock,
        }
    }

    pub fn zustand(&self) -> SprechZustand {
        self.zustand
    }

    /// "Spricht" gilt auch waehrend der Haltezeit
    pub fn spricht(&self) -> bool {
        matches!(
            self.zustand,
            SprechZustand::Spricht | SprechZustand::Abklingend(_)
        )
    }

    /// Wertet einen Tick aus; liefert den neuen Wert bei einem Wechsel
    ///
    /// `None` als Pegel (Abgriff getrennt) erzwingt sofort "still".
    pub fn messen(&mut self, pegel: Option<f32>) -> Option<bool> {
        let Some(pegel) = pegel else {
            return self.erzwingen_still();
        };
        let ueber = pegel > self.config.schwelle;
        let vorher = self.spricht();

        self.zustand = match (self.zustand, ueber) {
            (SprechZustand::Still, true) | (SprechZustand::Steigend(_), true) => {
                let n = match self.zustand {
                    SprechZustand::Steigend(n) => n + 1,
                    _ => 1,
                };
                if n >= self.config.frames.max(1) {
                    SprechZustand::Spricht
                } else {
                    SprechZustand::Steigend(n)
                }
            }
            (SprechZustand::Still, false) | (SprechZustand::Steigend(_), false) => {
                SprechZustand::Still
            }
            (SprechZustand::Spricht, true) | (SprechZustand::Abklingend(_), true) => {
                SprechZustand::Spricht
            }
            (SprechZustand::Spricht, false) => SprechZustand::Abklingend(
                self.clock.jetzt() + Duration::from_millis(self.config.halten_ms),
            ),
            (SprechZustand::Abklingend(frist), false) => {
                if self.clock.jetzt() >= frist {
                    SprechZustand::Still
                } else {
                    SprechZustand::Abklingend(frist)
                }
            }
        };

        let nachher = self.spricht();
        (vorher != nachher).then_some(nachher)
    }

    /// Setzt sofort auf "still"; liefert `Some(false)`, falls vorher gesprochen wurde
    pub fn erzwingen_still(&mut self) -> Option<bool> {
        let vorher = self.spricht();
        self.zustand = SprechZustand::Still;
        vorher.then_some(false)
    }

    /// Uebernimmt einen gemeldeten Zustand (entfernte Teilnehmer)
    pub fn setzen(&mut self, spricht: bool) -> Option<bool> {
        let vorher = self.spricht();
        self.zustand = if spricht {
            SprechZustand::Spricht
        } else {
            SprechZustand::Still
        };
        (vorher != spricht).then_some(spricht)
    }
}
