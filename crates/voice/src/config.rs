//! Engine-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! Standardwerte, sodass die Engine auch ohne Konfigurationsdatei laeuft.

use huddle_audio::{CaptureConfig, EffektConfig, PlaybackConfig};
use huddle_observability::logging::{log_format_gueltig, log_level_gueltig};
use huddle_protocol::OpusConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::detector::DetectorConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::speaker_buffer::SpeakerBufferConfig;

/// Umgebungsvariable mit dem Pfad der Konfigurationsdatei
pub const CONFIG_ENV: &str = "HUDDLE_CONFIG";

/// Standardpfad, falls weder `--config` noch `HUDDLE_CONFIG` gesetzt ist
pub const STANDARD_PFAD: &str = "huddle.toml";

/// Vollstaendige Engine-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HuddleConfig {
    /// Aufnahme, Codec und Geraeteauswahl
    pub audio: AudioEinstellungen,
    /// Speaker-Buffer je Teilnehmer
    pub puffer: SpeakerBufferConfig,
    /// Dekodierung, Effekte und Ausgabe
    pub wiedergabe: WiedergabeEinstellungen,
    /// Sprecher-Erkennung
    pub sprecher: DetectorConfig,
    pub transport: TransportEinstellungen,
    pub logging: LoggingEinstellungen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEinstellungen {
    pub capture: CaptureConfig,
    pub codec: OpusConfig,
    /// Bevorzugtes Eingabegeraet (leer = Standardgeraet)
    pub eingabegeraet: Option<String>,
    /// Bevorzugtes Ausgabegeraet (leer = Standardgeraet)
    pub ausgabegeraet: Option<String>,
    /// Polling-Intervall des Hot-Plug-Waechters in Millisekunden
    pub geraete_intervall_ms: u64,
}

impl Default for AudioEinstellungen {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            codec: OpusConfig::default(),
            eingabegeraet: None,
            ausgabegeraet: None,
            geraete_intervall_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WiedergabeEinstellungen {
    /// Abstand zwischen Dekodier-Ende und Wiedergabebeginn
    pub latenz_ms: u64,
    /// Master-Lautstaerke 0.0..1.0
    pub lautstaerke: f32,
    pub effekte: EffektConfig,
    /// Dekodierung im Blocking-Pool von Tokio statt im Tick-Task
    pub dekodier_pool: bool,
    pub ausgabe: PlaybackConfig,
}

impl Default for WiedergabeEinstellungen {
    fn default() -> Self {
        Self {
            latenz_ms: 20,
            lautstaerke: 1.0,
            effekte: EffektConfig::default(),
            dekodier_pool: true,
            ausgabe: PlaybackConfig::default(),
        }
    }
}

impl WiedergabeEinstellungen {
    pub fn latenz(&self) -> Duration {
        Duration::from_millis(self.latenz_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportEinstellungen {
    /// Adresse des Raum-Servers (`host:port`)
    pub server: String,
    pub verbindungs_timeout_ms: u64,
}

impl Default for TransportEinstellungen {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:7300".into(),
            verbindungs_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: trace, debug, info, warn, error
    pub level: String,
    /// Ausgabeformat: text oder json
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl HuddleConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei
    ///
    /// Fehlt die Datei, werden die Standardwerte verwendet.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        let config: Self = match std::fs::read_to_string(pfad) {
            Ok(inhalt) => toml::from_str(&inhalt)
                .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
                ))
            }
        };
        config.validieren()?;
        Ok(config)
    }

    /// Pfad aus `--config`, sonst `HUDDLE_CONFIG`, sonst `huddle.toml`
    pub fn pfad_bestimmen(argument: Option<String>) -> String {
        argument
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| STANDARD_PFAD.to_string())
    }

    /// Prueft Wertebereiche und Querbezuege
    pub fn validieren(&self) -> VoiceResult<()> {
        let fehler = |m: String| Err(VoiceError::Konfiguration(m));

        self.audio.codec.validieren().map_err(VoiceError::Konfiguration)?;
        if self.puffer.chunk_ms != self.audio.codec.frame_ms as u64 {
            return fehler(format!(
                "puffer.chunk_ms ({}) muss der Frame-Dauer des Codecs ({} ms) entsprechen",
                self.puffer.chunk_ms, self.audio.codec.frame_ms
            ));
        }
        if self.puffer.ziel_ms == 0 || self.puffer.ziel_ms > self.puffer.max_warten_ms {
            return fehler(format!(
                "puffer.ziel_ms ({}) muss zwischen 1 und max_warten_ms ({}) liegen",
                self.puffer.ziel_ms, self.puffer.max_warten_ms
            ));
        }
        if self.puffer.kapazitaet == 0 {
            return fehler("puffer.kapazitaet muss groesser als 0 sein".into());
        }
        if !(0.0..=1.0).contains(&self.wiedergabe.lautstaerke) {
            return fehler(format!(
                "wiedergabe.lautstaerke muss zwischen 0.0 und 1.0 liegen (war: {})",
                self.wiedergabe.lautstaerke
            ));
        }
        if self.sprecher.tick_ms == 0 || self.sprecher.frames == 0 {
            return fehler("sprecher.tick_ms und sprecher.frames muessen groesser als 0 sein".into());
        }
        if !log_level_gueltig(&self.logging.level) {
            return fehler(format!("Unbekanntes Log-Level '{}'", self.logging.level));
        }
        if !log_format_gueltig(&self.logging.format) {
            return fehler(format!("Unbekanntes Log-Format '{}'", self.logging.format));
        }
        Ok(())
    }
}
