//! Wiedergabe-Pipeline je Teilnehmer
//!
//! Eine Flush-Einheit wird Chunk fuer Chunk dekodiert, das PCM
//! aneinandergehaengt und durch die Sprach-Effektkette geschickt. Der
//! Decoder bleibt ueber Einheiten hinweg erhalten (Opus-Zustand).

use huddle_audio::{
    einheit_dekodieren, AudioDecoder, AudioPipeline, AudioResult, CodecFactory, EffektConfig,
};
use parking_lot::Mutex;

pub struct PeerPipeline {
    // Decoder sind nur `Send`; der Mutex macht den Peer-Eintrag `Sync`
    decoder: Mutex<Box<dyn AudioDecoder>>,
    effekte: AudioPipeline,
}

impl PeerPipeline {
    pub fn neu(codec: &dyn CodecFactory, effekte: &EffektConfig, sample_rate: u32) -> AudioResult<Self> {
        Ok(Self {
            decoder: Mutex::new(codec.decoder()?),
            effekte: AudioPipeline::sprach_kette(effekte, sample_rate),
        })
    }

    /// Dekodiert eine Einheit und wendet die Effekte an
    ///
    /// `Ok(None)` bei leerem Ergebnis; ein Fehler verwirft nur diese Einheit.
    pub fn verarbeiten(&mut self, chunks: &[Vec<u8>]) -> AudioResult<Option<Vec<f32>>> {
        let mut pcm = einheit_dekodieren(self.decoder.get_mut().as_mut(), chunks)?;
        if pcm.is_empty() {
            return Ok(None);
        }
        self.effekte.process(&mut pcm);
        Ok(Some(pcm))
    }
}

/// Verarbeitet eine Einheit, wahlweise im Blocking-Pool
///
/// Die Pipeline wird immer zurueckgegeben, damit der Teilnehmer sie fuer
/// die naechste Einheit wiederverwenden kann.
pub async fn einheit_verarbeiten(
    mut pipeline: PeerPipeline,
    chunks: Vec<Vec<u8>>,
    blocking_pool: bool,
) -> Option<(PeerPipeline, AudioResult<Option<Vec<f32>>>)> {
    if !blocking_pool {
        let ergebnis = pipeline.verarbeiten(&chunks);
        return Some((pipeline, ergebnis));
    }
    match tokio::task::spawn_blocking(move || {
        let ergebnis = pipeline.verarbeiten(&chunks);
        (pipeline, ergebnis)
    })
    .await
    {
        Ok(paar) => Some(paar),
        Err(e) => {
            tracing::error!(fehler = %e, "Dekodier-Task abgebrochen");
            None
        }
    }
}
