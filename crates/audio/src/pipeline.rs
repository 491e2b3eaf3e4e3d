//! Effekt-Kette der Wiedergabe
//!
//! Dekodierte Sprache laeuft pro Teilnehmer durch
//! Kompressor -> Bandpass -> High-Shelf, bevor sie in den Mixer geht.
//! Die Master-Lautstaerke sitzt im Mixer und ist fuer alle Quellen gemeinsam.

use serde::{Deserialize, Serialize};

use crate::dsp::{AudioProcessor, Biquad, Kompressor, KompressorConfig};

/// Parameter der Sprach-Effektkette
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffektConfig {
    pub kompressor: KompressorConfig,
    /// Mittenfrequenz des Bandpasses in Hz
    pub bandpass_hz: f32,
    pub bandpass_q: f32,
    /// Eckfrequenz des High-Shelf in Hz
    pub hoehen_hz: f32,
    pub hoehen_gain_db: f32,
}

impl Default for EffektConfig {
    fn default() -> Self {
        Self {
            kompressor: KompressorConfig::default(),
            bandpass_hz: 1000.0,
            bandpass_q: 0.7,
            hoehen_hz: 3000.0,
            hoehen_gain_db: 6.0,
        }
    }
}

/// Kette von `AudioProcessor`-Implementierungen
pub struct AudioPipeline {
    processors: Vec<Box<dyn AudioProcessor>>,
}

impl AudioPipeline {
    pub fn new(processors: Vec<Box<dyn AudioProcessor>>) -> Self {
        Self { processors }
    }

    /// Leere Pipeline ohne Prozessoren
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Sprach-Kette: Kompressor -> Bandpass -> High-Shelf
    pub fn sprach_kette(config: &EffektConfig, sample_rate: u32) -> Self {
        let fs = sample_rate as f32;
        Self::new(vec![
            Box::new(Kompressor::new(config.kompressor.clone(), fs)),
            Box::new(Biquad::band_pass(fs, config.bandpass_hz, config.bandpass_q)),
            Box::new(Biquad::high_shelf(fs, config.hoehen_hz, config.hoehen_gain_db)),
        ])
    }

    /// Verarbeitet die Samples in-place durch alle aktiven Prozessoren
    pub fn process(&mut self, samples: &mut [f32]) {
        for processor in self.processors.iter_mut() {
            processor.process(samples);
        }
    }

    pub fn push(&mut self, processor: Box<dyn AudioProcessor>) {
        self.processors.push(processor);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn reset_all(&mut self) {
        for p in self.processors.iter_mut() {
            p.reset();
        }
    }

    pub fn set_all_enabled(&mut self, enabled: bool) {
        for p in self.processors.iter_mut() {
            p.set_enabled(enabled);
        }
    }
}
