//! Capture-Session: Mikrofon -> Analyse-Abgriff + Opus-Chunks
//!
//! Ein Pump-Thread liest das geoeffnete Mikrofon, schneidet 10-ms-Frames,
//! aktualisiert den Pegel-Abgriff fuer die lokale Sprecher-Erkennung und
//! kodiert jeden Frame zu einem [`EncodedChunk`]. Stummschalten haelt das
//! Geraet belegt, unterbricht aber Abgriff und Chunk-Ausgabe.

use huddle_core::types::{RoomId, UserId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::capture::CaptureConfig;
use crate::codec::{AudioEncoder, CodecFactory, EncodedChunk};
use crate::device::DeviceBackend;
use crate::dsp::rms;
use crate::error::{AudioError, AudioResult};

/// Callback fuer fertig kodierte Chunks (laeuft im Pump-Thread)
pub type ChunkCallback = Arc<dyn Fn(EncodedChunk) + Send + Sync>;

/// Letzter Pegel des Rohsignals; `None` solange kein Signal anliegt
#[derive(Clone, Default)]
pub struct AnalyseAbgriff {
    pegel: Arc<Mutex<Option<f32>>>,
}

impl AnalyseAbgriff {
    pub fn lesen(&self) -> Option<f32> {
        *self.pegel.lock()
    }

    fn setzen(&self, wert: Option<f32>) {
        *self.pegel.lock() = wert;
    }
}

// ---------------------------------------------------------------------------
// CaptureProcessor
// ---------------------------------------------------------------------------

/// Zerlegt Rohsamples in Frames, misst den Pegel und kodiert
pub struct CaptureProcessor {
    encoder: Box<dyn AudioEncoder>,
    room_id: RoomId,
    user_id: UserId,
    ausstehend: Vec<f32>,
    abgriff: AnalyseAbgriff,
}

impl CaptureProcessor {
    pub fn neu(
        encoder: Box<dyn AudioEncoder>,
        room_id: RoomId,
        user_id: UserId,
        abgriff: AnalyseAbgriff,
    ) -> Self {
        Self {
            encoder,
            room_id,
            user_id,
            ausstehend: Vec::new(),
            abgriff,
        }
    }

    /// Verarbeitet neue Samples; stumm verwirft alles und trennt den Abgriff
    pub fn verarbeiten(&mut self, samples: &[f32], stumm: bool) -> Vec<EncodedChunk> {
        if stumm {
            self.ausstehend.clear();
            self.abgriff.setzen(None);
            return Vec::new();
        }

        self.ausstehend.extend_from_slice(samples);
        let frame = self.encoder.frame_size();
        let mut chunks = Vec::new();
        while self.ausstehend.len() >= frame {
            let pcm: Vec<f32> = self.ausstehend.drain(..frame).collect();
            self.abgriff.setzen(Some(rms(&pcm)));
            match self.encoder.encode(&pcm) {
                Ok(audio) => chunks.push(EncodedChunk {
                    room_id: self.room_id,
                    user_id: self.user_id,
                    audio,
                }),
                Err(e) => warn!(fehler = %e, "Frame konnte nicht kodiert werden"),
            }
        }
        chunks
    }
}

// ---------------------------------------------------------------------------
// CaptureSession
// ---------------------------------------------------------------------------

struct Pumpe {
    geraet: String,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct CaptureInner {
    backend: Arc<dyn DeviceBackend>,
    config: CaptureConfig,
    codec: Arc<dyn CodecFactory>,
    room_id: RoomId,
    user_id: UserId,
    stumm: Arc<AtomicBool>,
    abgriff: AnalyseAbgriff,
    callbacks: Arc<RwLock<Vec<ChunkCallback>>>,
    pumpe: Mutex<Option<Pumpe>>,
}

/// Mikrofon-Aufnahme eines Raums
pub struct CaptureSession {
    inner: CaptureInner,
}

impl CaptureSession {
    pub fn neu(
        backend: Arc<dyn DeviceBackend>,
        config: CaptureConfig,
        codec: Arc<dyn CodecFactory>,
        room_id: RoomId,
        user_id: UserId,
    ) -> Self {
        Self {
            inner: CaptureInner {
                backend,
                config,
                codec,
                room_id,
                user_id,
                stumm: Arc::new(AtomicBool::new(false)),
                abgriff: AnalyseAbgriff::default(),
                callbacks: Arc::new(RwLock::new(Vec::new())),
                pumpe: Mutex::new(None),
            },
        }
    }

    /// Registriert einen Empfaenger fuer kodierte Chunks
    pub fn on_encoded_chunk<F>(&self, callback: F)
    where
        F: Fn(EncodedChunk) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().push(Arc::new(callback));
    }

    /// Oeffnet das Mikrofon (`None` = Standard) und startet die Aufnahme
    ///
    /// Schlaegt das Oeffnen fehl, bleibt die Session ungestartet und kein
    /// Geraet belegt.
    pub fn start(&self, geraet: Option<&str>) -> AudioResult<()> {
        let mut pumpe = self.inner.pumpe.lock();
        if pumpe.is_some() {
            debug!("Capture laeuft bereits");
            return Ok(());
        }

        let mut mikrofon = self
            .inner
            .backend
            .mikrofon_oeffnen(geraet, &self.inner.config)?;
        // Schlaegt der Encoder fehl, wird das Mikrofon hier wieder gedroppt
        let encoder = self.inner.codec.encoder()?;
        let name = mikrofon.geraet().to_string();

        let mut processor = CaptureProcessor::neu(
            encoder,
            self.inner.room_id,
            self.inner.user_id,
            self.inner.abgriff.clone(),
        );
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let stumm = Arc::clone(&self.inner.stumm);
        let callbacks = Arc::clone(&self.inner.callbacks);
        let abgriff = self.inner.abgriff.clone();
        let thread_geraet = name.clone();

        let thread = std::thread::Builder::new()
            .name("huddle-capture-pumpe".to_string())
            .spawn(move || {
                let mut puffer = Vec::with_capacity(4096);
                while !stop_flag.load(Ordering::SeqCst) {
                    puffer.clear();
                    if let Err(e) = mikrofon.lesen(&mut puffer, Duration::from_millis(5)) {
                        error!(geraet = %thread_geraet, fehler = %e, "Capture abgebrochen");
                        break;
                    }
                    let chunks = processor.verarbeiten(&puffer, stumm.load(Ordering::SeqCst));
                    if chunks.is_empty() {
                        continue;
                    }
                    let empfaenger = callbacks.read().clone();
                    for chunk in chunks {
                        for cb in &empfaenger {
                            cb(chunk.clone());
                        }
                    }
                }
                abgriff.setzen(None);
                // Mikrofon wird mit dem Thread gedroppt und damit freigegeben
            })
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?;

        info!(geraet = %name, room = %self.inner.room_id, "Capture gestartet");
        *pumpe = Some(Pumpe {
            geraet: name,
            stop,
            thread,
        });
        Ok(())
    }

    /// Beendet die Aufnahme und gibt das Geraet frei
    pub fn stop(&self) {
        let Some(pumpe) = self.inner.pumpe.lock().take() else {
            return;
        };
        pumpe.stop.store(true, Ordering::SeqCst);
        if pumpe.thread.join().is_err() {
            error!("Capture-Thread ist abgestuerzt");
        }
        self.inner.abgriff.setzen(None);
        info!(geraet = %pumpe.geraet, "Capture gestoppt");
    }

    /// Schaltet stumm bzw. laut; liefert `true`, wenn sich etwas geaendert hat
    pub fn set_muted(&self, stumm: bool) -> bool {
        let vorher = self.inner.stumm.swap(stumm, Ordering::SeqCst);
        if vorher != stumm {
            debug!(stumm, "Capture-Stummschaltung geaendert");
        }
        vorher != stumm
    }

    pub fn ist_muted(&self) -> bool {
        self.inner.stumm.load(Ordering::SeqCst)
    }

    pub fn ist_gestartet(&self) -> bool {
        self.inner.pumpe.lock().is_some()
    }

    /// Geraet der laufenden Aufnahme
    pub fn geraet(&self) -> Option<String> {
        self.inner.pumpe.lock().as_ref().map(|p| p.geraet.clone())
    }

    /// Aktueller Pegel fuer die Sprecher-Erkennung; `None` wenn stumm oder gestoppt
    pub fn letzter_pegel(&self) -> Option<f32> {
        if self.ist_muted() {
            return None;
        }
        self.inner.abgriff.lesen()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpusCodec;
    use crate::dsp::testsignal::sinus;
    use crate::virtuell::{VirtuellerFehler, VirtuellesBackend};
    use std::time::Instant;

    /// Kodiert zu festen Bytes, ohne Opus
    struct ZaehlEncoder;

    impl AudioEncoder for ZaehlEncoder {
        fn encode(&mut self, pcm: &[f32]) -> AudioResult<Vec<u8>> {
            Ok(vec![pcm.len() as u8])
        }

        fn frame_size(&self) -> usize {
            480
        }
    }

    fn processor() -> (CaptureProcessor, AnalyseAbgriff) {
        let abgriff = AnalyseAbgriff::default();
        let p = CaptureProcessor::neu(
            Box::new(ZaehlEncoder),
            RoomId::new(),
            UserId::new(),
            abgriff.clone(),
        );
        (p, abgriff)
    }

    fn session(backend: &VirtuellesBackend) -> CaptureSession {
        CaptureSession::neu(
            Arc::new(backend.clone()),
            CaptureConfig::default(),
            Arc::new(OpusCodec::default()),
            RoomId::new(),
            UserId::new(),
        )
    }

    fn warten_bis(mut bedingung: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if bedingung() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn frames_zu_10ms_chunks() {
        let (mut p, abgriff) = processor();
        assert!(p.verarbeiten(&[0.1; 300], false).is_empty());
        let chunks = p.verarbeiten(&[0.1; 700], false);
        assert_eq!(chunks.len(), 2);
        assert!(abgriff.lesen().is_some());
        // 40 Samples bleiben fuer den naechsten Frame liegen
        assert_eq!(p.verarbeiten(&[0.1; 440], false).len(), 1);
    }

    #[test]
    fn stumm_verwirft_und_trennt_abgriff() {
        let (mut p, abgriff) = processor();
        p.verarbeiten(&[0.2; 300], false);
        assert!(p.verarbeiten(&[0.2; 960], true).is_empty());
        assert_eq!(abgriff.lesen(), None);
        // Angefangener Frame wurde verworfen
        assert!(p.verarbeiten(&[0.2; 300], false).is_empty());
    }

    #[test]
    fn start_stop_belegt_und_gibt_frei() {
        let backend = VirtuellesBackend::neu();
        let capture = session(&backend);
        capture.start(None).unwrap();
        assert!(capture.ist_gestartet());
        assert_eq!(backend.offene_mikrofone(), 1);

        capture.stop();
        assert!(!capture.ist_gestartet());
        assert_eq!(backend.offene_mikrofone(), 0);
    }

    #[test]
    fn fehlgeschlagener_start_belegt_nichts() {
        let backend = VirtuellesBackend::neu();
        backend.fehler_setzen(None, VirtuellerFehler::ZugriffVerweigert);
        let capture = session(&backend);
        assert!(matches!(
            capture.start(None),
            Err(AudioError::ZugriffVerweigert(_))
        ));
        assert!(!capture.ist_gestartet());
        assert_eq!(backend.offene_mikrofone(), 0);
    }

    #[test]
    fn kodierte_chunks_erreichen_callback() {
        let backend = VirtuellesBackend::neu();
        let capture = session(&backend);
        let empfangen = Arc::new(Mutex::new(Vec::new()));
        let ziel = Arc::clone(&empfangen);
        capture.on_encoded_chunk(move |c| ziel.lock().push(c));

        capture.start(None).unwrap();
        backend.einspeisen(&sinus(440.0, 0.5, 960));
        assert!(warten_bis(|| empfangen.lock().len() == 2));
        assert!(capture.letzter_pegel().unwrap() > 0.1);
        capture.stop();
    }

    #[test]
    fn stummschalten_ist_idempotent() {
        let backend = VirtuellesBackend::neu();
        let capture = session(&backend);
        let empfangen = Arc::new(Mutex::new(0usize));
        let ziel = Arc::clone(&empfangen);
        capture.on_encoded_chunk(move |_| *ziel.lock() += 1);
        capture.start(None).unwrap();

        assert!(capture.set_muted(true));
        assert!(!capture.set_muted(true));
        assert!(capture.ist_muted());
        assert_eq!(capture.letzter_pegel(), None);
        // Geraet bleibt belegt
        assert_eq!(backend.offene_mikrofone(), 1);

        backend.einspeisen(&sinus(440.0, 0.5, 960));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*empfangen.lock(), 0);

        assert!(capture.set_muted(false));
        backend.einspeisen(&sinus(440.0, 0.5, 480));
        assert!(warten_bis(|| *empfangen.lock() == 1));
        capture.stop();
    }
}
