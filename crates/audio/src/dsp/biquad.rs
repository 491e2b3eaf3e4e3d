//! Biquad-Filter (RBJ Audio-EQ-Cookbook)
//!
//! Bandpass mit konstanter 0-dB-Spitze und High-Shelf (Steilheit S = 1).
//! Transposed Direct Form II.

use std::f32::consts::PI;

use super::{db_zu_linear, AudioProcessor};

#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
    enabled: bool,
}

impl Biquad {
    fn normalisiert(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
            enabled: true,
        }
    }

    /// Bandpass um `frequenz` mit Guete `q`
    pub fn band_pass(sample_rate: f32, frequenz: f32, q: f32) -> Self {
        let w0 = 2.0 * PI * frequenz / sample_rate;
        let alpha = w0.sin() / (2.0 * q.max(1e-4));
        Self::normalisiert(alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * w0.cos(), 1.0 - alpha)
    }

    /// High-Shelf ab `frequenz` mit `gain_db` Anhebung
    pub fn high_shelf(sample_rate: f32, frequenz: f32, gain_db: f32) -> Self {
        let a = db_zu_linear(gain_db / 2.0);
        let w0 = 2.0 * PI * frequenz / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / 2.0 * 2f32.sqrt();
        let wurzel_a_alpha = 2.0 * a.sqrt() * alpha;

        Self::normalisiert(
            a * ((a + 1.0) + (a - 1.0) * cos + wurzel_a_alpha),
            -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
            a * ((a + 1.0) + (a - 1.0) * cos - wurzel_a_alpha),
            (a + 1.0) - (a - 1.0) * cos + wurzel_a_alpha,
            2.0 * ((a - 1.0) - (a + 1.0) * cos),
            (a + 1.0) - (a - 1.0) * cos - wurzel_a_alpha,
        )
    }
}

impl AudioProcessor for Biquad {
    fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for s in samples.iter_mut() {
            let x = *s;
            let y = self.b0 * x + self.z1;
            self.z1 = self.b1 * x - self.a1 * y + self.z2;
            self.z2 = self.b2 * x - self.a2 * y;
            *s = y;
        }
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::{rms, testsignal::sinus};

    /// Verstaerkung im eingeschwungenen Zustand (zweite Haelfte)
    fn verstaerkung(filter: &mut Biquad, frequenz: f32) -> f32 {
        let eingang = sinus(frequenz, 0.5, 9600);
        let mut ausgang = eingang.clone();
        filter.process(&mut ausgang);
        rms(&ausgang[4800..]) / rms(&eingang[4800..])
    }

    #[test]
    fn bandpass_laesst_mitte_durch() {
        let mut bp = Biquad::band_pass(48_000.0, 1000.0, 0.7);
        let g = verstaerkung(&mut bp, 1000.0);
        assert!((0.9..1.05).contains(&g), "Verstaerkung bei 1 kHz: {g}");
    }

    #[test]
    fn bandpass_daempft_raender() {
        let mut bp = Biquad::band_pass(48_000.0, 1000.0, 0.7);
        assert!(verstaerkung(&mut bp, 100.0) < 0.3);
        bp.reset();
        assert!(verstaerkung(&mut bp, 10_000.0) < 0.3);
    }

    #[test]
    fn high_shelf_hebt_hoehen_an() {
        let mut hs = Biquad::high_shelf(48_000.0, 3000.0, 6.0);
        let hoch = verstaerkung(&mut hs, 15_000.0);
        assert!((1.7..2.1).contains(&hoch), "Verstaerkung bei 15 kHz: {hoch}");
        hs.reset();
        let tief = verstaerkung(&mut hs, 100.0);
        assert!((0.95..1.05).contains(&tief), "Verstaerkung bei 100 Hz: {tief}");
    }

    #[test]
    fn deaktiviert_ist_durchgang() {
        let mut bp = Biquad::band_pass(48_000.0, 1000.0, 0.7);
        bp.set_enabled(false);
        let mut samples = vec![0.3; 64];
        bp.process(&mut samples);
        assert!(samples.iter().all(|&s| s == 0.3));
    }
}
