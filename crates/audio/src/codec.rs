//! Audio-Codec: Opus-Encoder/Decoder hinter austauschbaren Traits
//!
//! Capture und Wiedergabe kennen nur [`AudioEncoder`], [`AudioDecoder`] und
//! die [`CodecFactory`]; Produktion nutzt Opus ueber audiopus.

use audiopus::{
    coder::{Decoder, Encoder},
    Application, Channels, SampleRate,
};
use huddle_core::types::{RoomId, UserId};
use huddle_protocol::codec::{OpusApplication, OpusConfig};
use tracing::debug;

use crate::error::{AudioError, AudioResult};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Kodiert PCM-Frames fester Laenge
pub trait AudioEncoder: Send {
    /// Kodiert genau einen Frame (`frame_size()` Samples, Mono)
    fn encode(&mut self, pcm: &[f32]) -> AudioResult<Vec<u8>>;

    /// Erwartete Frame-Groesse in Samples
    fn frame_size(&self) -> usize;
}

/// Dekodiert einzelne Chunks zu PCM
pub trait AudioDecoder: Send {
    fn decode(&mut self, daten: &[u8]) -> AudioResult<Vec<f32>>;
}

/// Erzeugt Encoder und Decoder einer Codec-Konfiguration
pub trait CodecFactory: Send + Sync + 'static {
    fn encoder(&self) -> AudioResult<Box<dyn AudioEncoder>>;
    fn decoder(&self) -> AudioResult<Box<dyn AudioDecoder>>;
}

/// Dekodiert eine Flush-Einheit: alle Chunks der Reihe nach, PCM aneinandergehaengt
///
/// Ein einziger fehlerhafter Chunk verwirft die ganze Einheit.
pub fn einheit_dekodieren(
    decoder: &mut dyn AudioDecoder,
    chunks: &[Vec<u8>],
) -> AudioResult<Vec<f32>> {
    let mut pcm = Vec::new();
    for chunk in chunks {
        pcm.extend(decoder.decode(chunk)?);
    }
    Ok(pcm)
}

/// Ein kodierter Audio-Chunk eines Teilnehmers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub audio: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Opus
// ---------------------------------------------------------------------------

/// Opus-Encoder: kodiert f32-PCM zu Opus-Bytes
pub struct OpusEncoder {
    encoder: Encoder,
    config: OpusConfig,
    frame_size: usize,
}

impl OpusEncoder {
    pub fn new(config: OpusConfig) -> AudioResult<Self> {
        config.validieren().map_err(AudioError::Konfiguration)?;

        let mut encoder = Encoder::new(
            opus_rate(config.sample_rate)?,
            Channels::Mono,
            opus_application(config.application),
        )
        .map_err(|e| AudioError::KodierFehler(e.to_string()))?;

        encoder
            .set_bitrate(audiopus::Bitrate::BitsPerSecond(
                (config.bitrate_kbps as i32) * 1000,
            ))
            .map_err(|e| AudioError::KodierFehler(e.to_string()))?;
        encoder
            .set_complexity(config.complexity)
            .map_err(|e| AudioError::KodierFehler(e.to_string()))?;
        encoder
            .set_inband_fec(config.fec_enabled)
            .map_err(|e| AudioError::KodierFehler(e.to_string()))?;
        if config.dtx_enabled {
            // OPUS_SET_DTX_REQUEST = 4016 (audiopus 0.2 hat kein set_dtx)
            let _ = encoder.set_encoder_ctl_request(4016, 1);
        }

        let frame_size = config.samples_per_frame();
        debug!(
            bitrate_kbps = config.bitrate_kbps,
            frame_size, "OpusEncoder erstellt"
        );

        Ok(Self {
            encoder,
            config,
            frame_size,
        })
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }
}

impl AudioEncoder for OpusEncoder {
    fn encode(&mut self, pcm: &[f32]) -> AudioResult<Vec<u8>> {
        if pcm.len() != self.frame_size {
            return Err(AudioError::KodierFehler(format!(
                "PCM-Frame muss {} Samples lang sein, war {}",
                self.frame_size,
                pcm.len()
            )));
        }

        // 4000 Bytes reichen fuer jeden Opus-Frame
        let mut output = vec![0u8; 4000];
        let geschrieben = self
            .encoder
            .encode_float(pcm, &mut output)
            .map_err(|e| AudioError::KodierFehler(e.to_string()))?;
        output.truncate(geschrieben);
        Ok(output)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }
}

/// Opus-Decoder: dekodiert Opus-Bytes zu f32-PCM (Mono)
pub struct OpusDecoder {
    decoder: Decoder,
    max_frame: usize,
}

impl OpusDecoder {
    pub fn new(config: &OpusConfig) -> AudioResult<Self> {
        let decoder = Decoder::new(opus_rate(config.sample_rate)?, Channels::Mono)
            .map_err(|e| AudioError::DekodierFehler(e.to_string()))?;
        Ok(Self {
            decoder,
            max_frame: config.max_samples_per_frame(),
        })
    }
}

impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, daten: &[u8]) -> AudioResult<Vec<f32>> {
        if daten.is_empty() {
            return Err(AudioError::DekodierFehler("Leerer Chunk".into()));
        }
        let mut output = vec![0.0f32; self.max_frame];
        let dekodiert = self
            .decoder
            .decode_float(Some(daten), &mut output, false)
            .map_err(|e| AudioError::DekodierFehler(e.to_string()))?;
        output.truncate(dekodiert);
        Ok(output)
    }
}

/// Codec-Fabrik fuer Opus
#[derive(Debug, Clone, Default)]
pub struct OpusCodec {
    config: OpusConfig,
}

impl OpusCodec {
    pub fn neu(config: OpusConfig) -> AudioResult<Self> {
        config.validieren().map_err(AudioError::Konfiguration)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }
}

impl CodecFactory for OpusCodec {
    fn encoder(&self) -> AudioResult<Box<dyn AudioEncoder>> {
        Ok(Box::new(OpusEncoder::new(self.config.clone())?))
    }

    fn decoder(&self) -> AudioResult<Box<dyn AudioDecoder>> {
        Ok(Box::new(OpusDecoder::new(&self.config)?))
    }
}

// ---------------------------------------------------------------------------
// Konvertierungs-Hilfsfunktionen
// ---------------------------------------------------------------------------

fn opus_rate(rate: u32) -> AudioResult<SampleRate> {
    match rate {
        8000 => Ok(SampleRate::Hz8000),
        12000 => Ok(SampleRate::Hz12000),
        16000 => Ok(SampleRate::Hz16000),
        24000 => Ok(SampleRate::Hz24000),
        48000 => Ok(SampleRate::Hz48000),
        andere => Err(AudioError::Konfiguration(format!(
            "Opus unterstuetzt {andere} Hz nicht"
        ))),
    }
}

fn opus_application(app: OpusApplication) -> Application {
    match app {
        OpusApplication::Voip => Application::Voip,
        OpusApplication::Audio => Application::Audio,
        OpusApplication::RestrictedLowdelay => Application::LowDelay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sinus(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin() * 0.5)
            .collect()
    }

    #[test]
    fn encoder_standard_frame_ist_10ms() {
        let enc = OpusEncoder::new(OpusConfig::default()).unwrap();
        assert_eq!(enc.frame_size(), 480);
        assert_eq!(enc.config().bitrate_kbps, 32);
    }

    #[test]
    fn encoder_falsche_frame_laenge() {
        let mut enc = OpusEncoder::new(OpusConfig::default()).unwrap();
        assert!(matches!(
            enc.encode(&[0.0; 100]),
            Err(AudioError::KodierFehler(_))
        ));
    }

    #[test]
    fn ungueltige_konfiguration_abgelehnt() {
        let config = OpusConfig {
            sample_rate: 44_100,
            ..OpusConfig::default()
        };
        assert!(OpusCodec::neu(config).is_err());
    }

    #[test]
    fn einheit_aus_mehreren_chunks() {
        let codec = OpusCodec::default();
        let mut enc = codec.encoder().unwrap();
        let mut dec = codec.decoder().unwrap();

        let chunks: Vec<Vec<u8>> = (0..3).map(|_| enc.encode(&sinus(480)).unwrap()).collect();
        let pcm = einheit_dekodieren(dec.as_mut(), &chunks).unwrap();
        assert_eq!(pcm.len(), 3 * 480);
    }

    #[test]
    fn kaputter_chunk_verwirft_einheit() {
        let codec = OpusCodec::default();
        let mut enc = codec.encoder().unwrap();
        let mut dec = codec.decoder().unwrap();

        let chunks = vec![enc.encode(&sinus(480)).unwrap(), Vec::new()];
        assert!(matches!(
            einheit_dekodieren(dec.as_mut(), &chunks),
            Err(AudioError::DekodierFehler(_))
        ));
    }
}
