//! DSP-Bausteine der Wiedergabe-Kette
//!
//! Alle Module implementieren das `AudioProcessor` Trait fuer
//! eine einheitliche Pipeline-Integration.

pub mod biquad;
pub mod compressor;

pub use biquad::Biquad;
pub use compressor::{Kompressor, KompressorConfig};

/// Gemeinsames Trait fuer alle Audio-Prozessoren
///
/// Alle DSP-Bausteine verarbeiten Samples in-place und sind
/// Send + Sync fuer Thread-sichere Pipeline-Nutzung.
pub trait AudioProcessor: Send + Sync {
    /// Verarbeitet einen Puffer von Samples in-place
    fn process(&mut self, samples: &mut [f32]);

    /// Setzt den internen Zustand zurueck (z.B. Filter-Historie)
    fn reset(&mut self);

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);
}

/// RMS-Pegel eines Frames (0.0 fuer leere Eingabe)
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

pub(crate) fn db_zu_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

pub(crate) fn linear_zu_db(wert: f32) -> f32 {
    20.0 * wert.max(1e-9).log10()
}

#[cfg(test)]
pub(crate) mod testsignal {
    /// Sinus mit gegebener Frequenz und Amplitude bei 48 kHz
    pub fn sinus(frequenz: f32, amplitude: f32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| {
                (2.0 * std::f32::consts::PI * frequenz * i as f32 / 48_000.0).sin() * amplitude
            })
            .collect()
    }
}
