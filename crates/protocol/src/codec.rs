//! Codec-Konfiguration fuer Audio-Chunks
//!
//! Alle Teilnehmer eines Raums senden Mono-Opus mit fester Frame-Dauer.
//! Die Frame-Dauer ist gleichzeitig die nominale Chunk-Dauer, mit der der
//! Jitter-Puffer die gepufferte Zeit schaetzt.

use serde::{Deserialize, Serialize};

/// Von Opus unterstuetzte Abtastraten
pub const OPUS_ABTASTRATEN: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Von Opus unterstuetzte Frame-Dauern in Zehntelmillisekunden
const OPUS_FRAME_ZEHNTEL_MS: [u32; 6] = [25, 50, 100, 200, 400, 600];

/// Opus-Anwendungsmodus
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    /// Optimiert fuer Sprachverstaendlichkeit
    #[default]
    Voip,
    Audio,
    RestrictedLowdelay,
}

/// Opus-Konfiguration eines Raums
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    /// Abtastrate in Hz
    pub sample_rate: u32,
    /// Frame-Dauer in Millisekunden (ganzzahlig: 10, 20, 40, 60)
    pub frame_ms: u32,
    /// Ziel-Bitrate in kbps (6-510)
    pub bitrate_kbps: u16,
    pub application: OpusApplication,
    /// Forward Error Correction
    pub fec_enabled: bool,
    /// Discontinuous Transmission
    pub dtx_enabled: bool,
    /// Komplexitaet 0-10
    pub complexity: u8,
}

impl Default for OpusConfig {
    /// 48 kHz Mono, 10-ms-Frames, 32 kbps VOIP
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frame_ms: 10,
            bitrate_kbps: 32,
            application: OpusApplication::Voip,
            fec_enabled: true,
            dtx_enabled: false,
            complexity: 8,
        }
    }
}

impl OpusConfig {
    /// Samples pro Frame (Mono)
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Groesster Frame, den ein Dekoder liefern kann (120 ms)
    pub fn max_samples_per_frame(&self) -> usize {
        self.sample_rate as usize * 120 / 1000
    }

    pub fn validieren(&self) -> Result<(), String> {
        if !OPUS_ABTASTRATEN.contains(&self.sample_rate) {
            return Err(format!(
                "Abtastrate {} Hz wird von Opus nicht unterstuetzt",
                self.sample_rate
            ));
        }
        if !OPUS_FRAME_ZEHNTEL_MS.contains(&(self.frame_ms * 10)) {
            return Err(format!(
                "Frame-Dauer {} ms wird von Opus nicht unterstuetzt",
                self.frame_ms
            ));
        }
        if self.bitrate_kbps < 6 || self.bitrate_kbps > 510 {
            return Err(format!(
                "Bitrate muss zwischen 6 und 510 kbps liegen (war: {})",
                self.bitrate_kbps
            ));
        }
        if self.complexity > 10 {
            return Err(format!(
                "Komplexitaet muss zwischen 0 und 10 liegen (war: {})",
                self.complexity
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_ist_10ms_bei_48khz() {
        let config = OpusConfig::default();
        assert_eq!(config.samples_per_frame(), 480);
        assert_eq!(config.max_samples_per_frame(), 5760);
        assert!(config.validieren().is_ok());
    }

    #[test]
    fn ungueltige_werte_werden_erkannt() {
        let mut config = OpusConfig::default();
        config.sample_rate = 44_100;
        assert!(config.validieren().is_err());

        let mut config = OpusConfig::default();
        config.frame_ms = 15;
        assert!(config.validieren().is_err());

        let mut config = OpusConfig::default();
        config.bitrate_kbps = 5;
        assert!(config.validieren().is_err());

        let mut config = OpusConfig::default();
        config.complexity = 11;
        assert!(config.validieren().is_err());
    }

    #[test]
    fn teilweise_konfiguration_nutzt_defaults() {
        let config: OpusConfig = serde_json::from_str(r#"{"bitrate_kbps": 24}"#).unwrap();
        assert_eq!(config.bitrate_kbps, 24);
        assert_eq!(config.frame_ms, 10);
        assert_eq!(config.application, OpusApplication::Voip);
    }
}
