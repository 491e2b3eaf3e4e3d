//! Dynamik-Kompressor
//!
//! Pegelerkennung pro Sample, statische Kennlinie mit weichem Knie,
//! Attack/Release-Glaettung der Absenkung und automatischer Make-up-Gain
//! (Verhalten wie ein Web-Audio-DynamicsCompressor).

use serde::{Deserialize, Serialize};

use super::{db_zu_linear, linear_zu_db, AudioProcessor};

/// Parameter des Kompressors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KompressorConfig {
    /// Einsatzpunkt in dBFS
    pub schwelle_db: f32,
    /// Kompressionsverhaeltnis (12 = 12:1)
    pub ratio: f32,
    /// Breite des weichen Knies in dB (0 = hartes Knie)
    pub knie_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    /// Pegelverlust ueber den gesamten Bereich automatisch ausgleichen
    pub auto_makeup: bool,
}

impl Default for KompressorConfig {
    fn default() -> Self {
        Self {
            schwelle_db: -50.0,
            ratio: 12.0,
            knie_db: 30.0,
            attack_ms: 3.0,
            release_ms: 250.0,
            auto_makeup: true,
        }
    }
}

fn zeit_zu_koeffizient(ms: f32, sample_rate: f32) -> f32 {
    if ms <= 0.0 {
        return 0.0;
    }
    (-1.0 / (ms / 1000.0 * sample_rate)).exp()
}

pub struct Kompressor {
    config: KompressorConfig,
    attack_coeff: f32,
    release_coeff: f32,
    makeup: f32,
    /// Aktuelle Absenkung in dB (<= 0)
    absenkung_db: f32,
    enabled: bool,
}

impl Kompressor {
    pub fn new(config: KompressorConfig, sample_rate: f32) -> Self {
        let attack_coeff = zeit_zu_koeffizient(config.attack_ms, sample_rate);
        let release_coeff = zeit_zu_koeffizient(config.release_ms, sample_rate);
        let mut k = Self {
            config,
            attack_coeff,
            release_coeff,
            makeup: 1.0,
            absenkung_db: 0.0,
            enabled: true,
        };
        if k.config.auto_makeup {
            // Vollaussteuerung (0 dBFS) soll nach Make-up wieder ~0.6 * Verlust erreichen
            let verlust = -k.kennlinie_db(0.0);
            k.makeup = db_zu_linear(0.6 * verlust);
        }
        k
    }

    /// Statische Kennlinie: Eingangspegel -> Ausgangspegel (dB)
    fn kennlinie_db(&self, pegel: f32) -> f32 {
        let t = self.config.schwelle_db;
        let r = self.config.ratio.max(1.0);
        let w = self.config.knie_db.max(0.0);
        let ueber = pegel - t;

        if 2.0 * ueber < -w {
            pegel
        } else if w > 0.0 && (2.0 * ueber).abs() <= w {
            pegel + (1.0 / r - 1.0) * (ueber + w / 2.0).powi(2) / (2.0 * w)
        } else {
            t + ueber / r
        }
    }

    pub fn aktuelle_absenkung_db(&self) -> f32 {
        self.absenkung_db
    }
}

impl AudioProcessor for Kompressor {
    fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for s in samples.iter_mut() {
            let pegel = linear_zu_db(s.abs());
            let ziel = (self.kennlinie_db(pegel) - pegel).min(0.0);

            // Mehr Absenkung: Attack, weniger Absenkung: Release
            let coeff = if ziel < self.absenkung_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.absenkung_db = coeff * self.absenkung_db + (1.0 - coeff) * ziel;

            *s *= db_zu_linear(self.absenkung_db) * self.makeup;
        }
    }

    fn reset(&mut self) {
        self.absenkung_db = 0.0;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}
