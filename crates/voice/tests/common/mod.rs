//! Gemeinsame Test-Umgebung: virtuelles Backend, virtueller Sink,
//! In-Memory-Transport und ein Codec ohne Opus

#![allow(dead_code)]

use huddle_audio::{
    AudioDecoder, AudioEncoder, AudioError, AudioResult, CaptureConfig, CodecFactory,
    DeviceRegistry, Quelle, VirtuellerSink, VirtuellesBackend,
};
use huddle_core::types::{RoomId, UserId};
use huddle_protocol::RoomMessage;
use huddle_voice::{
    AudioSession, ChannelTransport, HuddleConfig, SessionBausteine, SessionEvent, Transport,
    TransportEreignis, TransportGegenstelle, VoiceResult,
};
use huddle_audio::virtuell::Wiedergabe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};

/// Samples je dekodiertem Chunk (10 ms bei 48 kHz)
pub const CHUNK_SAMPLES: usize = 480;

/// Kodiert jeden Frame zu einem Byte; dekodiert jedes Byte zu 10 ms PCM
///
/// Das Byte `0xFF` gilt als beschaedigt.
pub struct TestCodec;

struct TestEncoder;
struct TestDecoder;

impl AudioEncoder for TestEncoder {
    fn encode(&mut self, _pcm: &[f32]) -> AudioResult<Vec<u8>> {
        Ok(vec![1])
    }

    fn frame_size(&self) -> usize {
        CHUNK_SAMPLES
    }
}

impl AudioDecoder for TestDecoder {
    fn decode(&mut self, daten: &[u8]) -> AudioResult<Vec<f32>> {
        if daten.first() == Some(&0xFF) {
            return Err(AudioError::DekodierFehler("beschaedigt".into()));
        }
        Ok(vec![0.1; CHUNK_SAMPLES])
    }
}

impl CodecFactory for TestCodec {
    fn encoder(&self) -> AudioResult<Box<dyn AudioEncoder>> {
        Ok(Box::new(TestEncoder))
    }

    fn decoder(&self) -> AudioResult<Box<dyn AudioDecoder>> {
        Ok(Box::new(TestDecoder))
    }
}

/// Haelt gesperrte Nachrichten eines [`SchrankenTransport`] zurueck
#[derive(Clone)]
pub struct Schranke {
    freigabe: Arc<Semaphore>,
    wartend: Arc<AtomicUsize>,
}

impl Schranke {
    /// Anzahl der Sendungen, die gerade an der Schranke haengen
    pub fn wartend(&self) -> usize {
        self.wartend.load(Ordering::SeqCst)
    }

    /// Laesst alle wartenden und kuenftigen Sendungen durch
    pub fn oeffnen(&self) {
        self.freigabe.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

pub struct SchrankenTransport {
    inner: ChannelTransport,
    typ: &'static str,
    schranke: Schranke,
}

#[async_trait::async_trait]
impl Transport for SchrankenTransport {
    async fn senden(&self, nachricht: RoomMessage) -> VoiceResult<()> {
        if nachricht.typ() == self.typ {
            self.schranke.wartend.fetch_add(1, Ordering::SeqCst);
            let erlaubnis = self.schranke.freigabe.acquire().await;
            self.schranke.wartend.fetch_sub(1, Ordering::SeqCst);
            if let Ok(erlaubnis) = erlaubnis {
                erlaubnis.forget();
            }
        }
        self.inner.senden(nachricht).await
    }

    fn abonnieren(&self) -> broadcast::Receiver<TransportEreignis> {
        self.inner.abonnieren()
    }

    fn ist_verbunden(&self) -> bool {
        self.inner.ist_verbunden()
    }
}

pub struct Umgebung {
    pub session: AudioSession,
    pub gegenstelle: TransportGegenstelle,
    pub backend: VirtuellesBackend,
    pub registry: DeviceRegistry,
    pub sink: VirtuellerSink,
    pub ereignisse: broadcast::Receiver<SessionEvent>,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub peer: UserId,
}

pub fn test_config() -> HuddleConfig {
    let mut config = HuddleConfig::default();
    config.wiedergabe.dekodier_pool = false;
    config
}

pub fn umgebung() -> Umgebung {
    let (transport, gegenstelle) = ChannelTransport::neu();
    umgebung_mit(Arc::new(transport), gegenstelle)
}

/// Umgebung, deren Transport Nachrichten vom Typ `typ` bis zur Freigabe anhaelt
pub fn umgebung_mit_schranke(typ: &'static str) -> (Umgebung, Schranke) {
    let (transport, gegenstelle) = ChannelTransport::neu();
    let schranke = Schranke {
        freigabe: Arc::new(Semaphore::new(0)),
        wartend: Arc::new(AtomicUsize::new(0)),
    };
    let transport = SchrankenTransport {
        inner: transport,
        typ,
        schranke: schranke.clone(),
    };
    (umgebung_mit(Arc::new(transport), gegenstelle), schranke)
}

fn umgebung_mit(transport: Arc<dyn Transport>, gegenstelle: TransportGegenstelle) -> Umgebung {
    let backend = VirtuellesBackend::neu();
    let registry = DeviceRegistry::neu(Arc::new(backend.clone()), CaptureConfig::default());
    let sink = VirtuellerSink::neu(48_000);

    let session = AudioSession::neu(
        test_config(),
        SessionBausteine {
            registry: registry.clone(),
            transport,
            codec: Arc::new(TestCodec),
            sink: Arc::new(sink.clone()),
            metriken: None,
        },
    );
    let ereignisse = session.subscribe();

    Umgebung {
        session,
        gegenstelle,
        backend,
        registry,
        sink,
        ereignisse,
        room_id: RoomId::new(),
        user_id: UserId::new(),
        peer: UserId::new(),
    }
}

impl Umgebung {
    pub async fn beitreten(&mut self) {
        self.session.join(self.room_id, self.user_id).await.unwrap();
        self.gegenstelle.gesendete();
    }

    /// Audio-Chunk des entfernten Teilnehmers
    pub fn chunk(&self, byte: u8) -> RoomMessage {
        RoomMessage::AudioStream {
            room_id: self.room_id,
            user_id: self.peer,
            audio: vec![byte],
        }
    }

    pub fn peer_wiedergaben(&self) -> Vec<Wiedergabe> {
        self.sink
            .protokoll()
            .into_iter()
            .filter(|w| w.quelle == Quelle::Peer(self.peer))
            .collect()
    }

    pub fn ereignisse(&mut self) -> Vec<SessionEvent> {
        let mut alle = Vec::new();
        while let Ok(e) = self.ereignisse.try_recv() {
            alle.push(e);
        }
        alle
    }
}

/// Zaehlt gesendete Nachrichten eines Typs
pub fn anzahl(nachrichten: &[RoomMessage], typ: &str) -> usize {
    nachrichten.iter().filter(|n| n.typ() == typ).count()
}

/// 100 ms lautes Signal
pub fn lautes_signal() -> Vec<f32> {
    (0..4800)
        .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin())
        .collect()
}
