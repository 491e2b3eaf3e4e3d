//! AudioSession – Zustandsmaschine einer Raum-Teilnahme
//!
//! ```text
//! Idle -> Joining -> Active -> Leaving -> Idle
//!            |                    ^
//!            +-- Fehler ----------+ (Rollback, Capture freigegeben)
//! ```
//!
//! Waehrend `Active` laufen in einem `JoinSet`:
//! - Chunk-Versand (Capture -> Transport)
//! - Eingangs-Dispatcher (Transport -> Peers, Moderation, Sound-Effekte)
//! - Flush-Takt (halbe Ziel-Dauer) mit je einer Wiedergabe pro Teilnehmer
//! - Sprecher-Takt fuer den lokalen Benutzer
//! - Reaktion auf Hardware-Aenderungen (Hot-Swap)
//!
//! Verlassen, Entfernen, Verbindungsverlust und Shutdown laufen ueber
//! denselben harten Stopp: Capture beenden, Tasks abbrechen, alle
//! Wiedergaben sofort stoppen, Peer-Zustand leeren.

use huddle_audio::{
    AudioSink, CaptureSession, CodecFactory, DeviceRegistry, EncodedChunk, Quelle, SoundLoader,
};
use huddle_audio::CallbackId;
use huddle_core::types::{RoomId, UserId};
use huddle_core::Clock;
use huddle_observability::VoiceMetrics;
use huddle_protocol::RoomMessage;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::TokioClock;
use crate::config::HuddleConfig;
use crate::detector::SpeakingDetector;
use crate::error::{VoiceError, VoiceResult};
use crate::moderation::{self, Direktive, ModerationChannel};
use crate::playback::{einheit_verarbeiten, PeerPipeline};
use crate::speaker_buffer::FlushEinheit;
use crate::state::{FlushSchritt, PeerArena, PeerInfo, PeerVorlage, Wiedergabe};
use crate::transport::{Transport, TransportEreignis};

const EREIGNIS_KAPAZITAET: usize = 256;

// ---------------------------------------------------------------------------
// Oeffentliche Typen
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Active,
    Leaving,
}

/// Ereignisse fuer lokale Abonnenten (Oberflaeche, Bots)
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ZustandGeaendert(SessionState),
    /// Sprechwechsel eines Teilnehmers (auch des lokalen Benutzers)
    Sprechend { user_id: UserId, spricht: bool },
    PeerBeigetreten(UserId),
    PeerVerlassen(UserId),
    PeerStumm { user_id: UserId, stumm: bool },
    /// Lokale Stummschaltung hat sich geaendert
    StummGeaendert(bool),
    /// Fuer den Benutzer sichtbarer Hinweis
    Hinweis(String),
    Entfernt { grund: Option<String>, gebannt: bool },
}

/// Aufrufe bei zwangsweiser Entfernung: `(grund, gebannt)`
pub type EntferntCallback = Arc<dyn Fn(Option<&str>, bool) + Send + Sync>;

/// Externe Bausteine einer Sitzung
pub struct SessionBausteine {
    pub registry: DeviceRegistry,
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<dyn CodecFactory>,
    pub sink: Arc<dyn AudioSink>,
    pub metriken: Option<VoiceMetrics>,
}

// ---------------------------------------------------------------------------
// Interner Zustand
// ---------------------------------------------------------------------------

/// Ressourcen eines beigetretenen Raums
struct Raum {
    room_id: RoomId,
    user_id: UserId,
    capture: Arc<CaptureSession>,
    geraete_callback: CallbackId,
}

struct SessionInner {
    config: HuddleConfig,
    registry: DeviceRegistry,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn CodecFactory>,
    sink: Arc<dyn AudioSink>,
    metriken: Option<VoiceMetrics>,
    clock: Arc<dyn Clock>,
    sound: SoundLoader,

    zustand: RwLock<SessionState>,
    raum: Mutex<Option<Raum>>,
    peers: PeerArena,
    lokal: Mutex<SpeakingDetector>,
    stumm: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
    ereignisse: broadcast::Sender<SessionEvent>,
    entfernt_callbacks: RwLock<Vec<EntferntCallback>>,
    wechsel_laeuft: AtomicBool,
}

/// Eine Audio-Sitzung; guenstig klonbar
#[derive(Clone)]
pub struct AudioSession {
    inner: Arc<SessionInner>,
}

impl AudioSession {
    pub fn neu(config: HuddleConfig, bausteine: SessionBausteine) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let sample_rate = config.wiedergabe.ausgabe.sample_rate;
        let peers = PeerArena::neu(PeerVorlage {
            puffer: config.puffer.clone(),
            sprecher: config.sprecher.clone(),
            effekte: config.wiedergabe.effekte.clone(),
            sample_rate,
            codec: Arc::clone(&bausteine.codec),
            clock: Arc::clone(&clock),
        });
        bausteine.sink.set_lautstaerke(config.wiedergabe.lautstaerke);
        let (ereignisse, _) = broadcast::channel(EREIGNIS_KAPAZITAET);

        Self {
            inner: Arc::new(SessionInner {
                lokal: Mutex::new(SpeakingDetector::neu(
                    config.sprecher.clone(),
                    Arc::clone(&clock),
                )),
                sound: SoundLoader::neu(sample_rate),
                registry: bausteine.registry,
                transport: bausteine.transport,
                codec: bausteine.codec,
                sink: bausteine.sink,
                metriken: bausteine.metriken,
                clock,
                zustand: RwLock::new(SessionState::Idle),
                raum: Mutex::new(None),
                peers,
                stumm: AtomicBool::new(false),
                tasks: Mutex::new(JoinSet::new()),
                ereignisse,
                entfernt_callbacks: RwLock::new(Vec::new()),
                wechsel_laeuft: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Tritt einem Raum bei
    ///
    /// Scheitert Capture oder Transport, kehrt die Sitzung nach `Idle`
    /// zurueck und kein Geraet bleibt belegt.
    pub async fn join(&self, room_id: RoomId, user_id: UserId) -> VoiceResult<()> {
        self.inner.join(room_id, user_id).await
    }

    /// Verlaesst den Raum; danach kann sofort wieder `join` aufgerufen werden
    pub async fn leave(&self) -> VoiceResult<()> {
        self.inner.leave().await
    }

    /// Lebenszyklus-Ende des Hosts: harter Stopp ohne Warten
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub async fn set_muted(&self, stumm: bool) {
        self.inner.stumm_setzen(stumm).await;
    }

    pub fn is_muted(&self) -> bool {
        self.inner.stumm.load(Ordering::SeqCst)
    }

    /// Master-Lautstaerke 0.0..1.0
    pub fn set_output_volume(&self, lautstaerke: f32) {
        self.inner.sink.set_lautstaerke(lautstaerke);
    }

    pub fn output_volume(&self) -> f32 {
        self.inner.sink.lautstaerke()
    }

    /// Lautstaerke eines einzelnen Teilnehmers im Mixer
    pub fn set_peer_volume(&self, peer: UserId, lautstaerke: f32) {
        self.inner.sink.set_peer_lautstaerke(peer, lautstaerke);
    }

    /// Spielt einen Sound-Effekt lokal und sendet ihn an den Raum
    pub async fn play_sound_effect(&self, url: &str) -> VoiceResult<()> {
        let (room_id, user_id) = self.inner.raum_ids().ok_or_else(|| {
            VoiceError::FalscherZustand(format!("{:?}", self.state()))
        })?;
        let pcm = self.inner.sound.laden(url).await?;
        self.inner.sink.abspielen(Quelle::Effekt, pcm, Duration::ZERO);
        self.inner
            .transport
            .senden(RoomMessage::SoundEffect {
                room_id,
                user_id,
                sound_url: url.to_string(),
            })
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.ereignisse.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.zustand.read()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.alle()
    }

    /// Spricht der lokale Benutzer gerade?
    pub fn spricht(&self) -> bool {
        self.inner.lokal.lock().spricht()
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.inner.raum_ids().map(|(r, _)| r)
    }

    pub fn on_forcibly_removed<F>(&self, callback: F)
    where
        F: Fn(Option<&str>, bool) + Send + Sync + 'static,
    {
        self.inner.entfernt_callbacks.write().push(Arc::new(callback));
    }

    /// Waehlt ein anderes Eingabegeraet; eine laufende Sitzung tritt neu bei
    pub async fn eingabe_wechseln(&self, geraet: &str) -> VoiceResult<()> {
        self.inner.registry.select_input(geraet)?;
        if let Some((room_id, user_id)) = self.inner.raum_ids() {
            if self.state() == SessionState::Active {
                self.inner.leave().await?;
                self.inner.join(room_id, user_id).await?;
            }
        }
        Ok(())
    }

    /// Moderations-Kanal fuer den aktuellen Raum
    pub fn moderation(&self, besitzer: bool) -> VoiceResult<ModerationChannel> {
        let (room_id, _) = self.inner.raum_ids().ok_or_else(|| {
            VoiceError::FalscherZustand(format!("{:?}", self.state()))
        })?;
        Ok(ModerationChannel::neu(
            Arc::clone(&self.inner.transport),
            room_id,
            besitzer,
        ))
    }

    pub fn metriken(&self) -> Option<&VoiceMetrics> {
        self.inner.metriken.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Lebenszyklus
// ---------------------------------------------------------------------------

impl SessionInner {
    fn zustand_setzen(&self, neu: SessionState) {
        let vorher = std::mem::replace(&mut *self.zustand.write(), neu);
        if vorher != neu {
            debug!(von = ?vorher, nach = ?neu, "Sitzungszustand");
            self.melden(SessionEvent::ZustandGeaendert(neu));
        }
    }

    fn melden(&self, ereignis: SessionEvent) {
        let _ = self.ereignisse.send(ereignis);
    }

    fn raum_ids(&self) -> Option<(RoomId, UserId)> {
        self.raum.lock().as_ref().map(|r| (r.room_id, r.user_id))
    }

    async fn join(self: &Arc<Self>, room_id: RoomId, user_id: UserId) -> VoiceResult<()> {
        {
            let mut z = self.zustand.write();
            if *z != SessionState::Idle {
                return Err(VoiceError::FalscherZustand(format!("{:?}", *z)));
            }
            *z = SessionState::Joining;
        }
        self.melden(SessionEvent::ZustandGeaendert(SessionState::Joining));

        match self.beitreten(room_id, user_id).await {
            Ok(()) => {
                // Shutdown oder Verbindungsverlust waehrend des Beitritts
                let vorher = {
                    let mut z = self.zustand.write();
                    let vorher = *z;
                    if vorher == SessionState::Joining {
                        *z = SessionState::Active;
                    }
                    vorher
                };
                if vorher != SessionState::Joining {
                    self.hart_stoppen();
                    self.leave_nachreichen(room_id, user_id);
                    warn!(room = %room_id, zustand = ?vorher, "Beitritt waehrenddessen abgebrochen");
                    return Err(VoiceError::FalscherZustand(format!("{vorher:?}")));
                }
                self.melden(SessionEvent::ZustandGeaendert(SessionState::Active));
                info!(room = %room_id, user = %user_id, "Raum beigetreten");
                Ok(())
            }
            Err(e) => {
                self.hart_stoppen();
                self.zustand_setzen(SessionState::Idle);
                warn!(room = %room_id, fehler = %e, "Beitritt fehlgeschlagen");
                Err(e)
            }
        }
    }

    async fn beitreten(self: &Arc<Self>, room_id: RoomId, user_id: UserId) -> VoiceResult<()> {
        if !self.transport.ist_verbunden() {
            return Err(VoiceError::TransportNichtVerfuegbar(
                "nicht verbunden".to_string(),
            ));
        }
        // Vor `join-room` abonnieren, damit keine Antwort verloren geht
        let eingang = self.transport.abonnieren();

        let capture = Arc::new(CaptureSession::neu(
            self.registry.backend(),
            self.config.audio.capture.clone(),
            Arc::clone(&self.codec),
            room_id,
            user_id,
        ));
        capture.set_muted(self.stumm.load(Ordering::SeqCst));
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<EncodedChunk>();
        capture.on_encoded_chunk(move |chunk| {
            let _ = chunk_tx.send(chunk);
        });
        capture.start(self.registry.aktueller_eingang().as_deref())?;

        let (geraete_tx, geraete_rx) = mpsc::unbounded_channel::<bool>();
        let geraete_callback = self.registry.on_change(move |aenderung| {
            let _ = geraete_tx.send(aenderung.eingang_betroffen);
        });
        *self.raum.lock() = Some(Raum {
            room_id,
            user_id,
            capture: Arc::clone(&capture),
            geraete_callback,
        });

        self.transport
            .senden(RoomMessage::JoinRoom { room_id, user_id })
            .await?;

        let mut tasks = self.tasks.lock();
        tasks.spawn(chunks_senden(Arc::clone(self), chunk_rx));
        tasks.spawn(eingang_verarbeiten(Arc::clone(self), eingang, room_id, user_id));
        tasks.spawn(flush_takt(Arc::clone(self)));
        tasks.spawn(sprecher_takt(Arc::clone(self), capture, user_id));
        tasks.spawn(geraete_beobachten(Arc::clone(self), geraete_rx, room_id, user_id));
        Ok(())
    }

    async fn leave(self: &Arc<Self>) -> VoiceResult<()> {
        {
            let mut z = self.zustand.write();
            match *z {
                SessionState::Idle => return Ok(()),
                SessionState::Active => *z = SessionState::Leaving,
                andere => return Err(VoiceError::FalscherZustand(format!("{andere:?}"))),
            }
        }
        self.melden(SessionEvent::ZustandGeaendert(SessionState::Leaving));

        if let Some((room_id, user_id)) = self.hart_stoppen() {
            if let Err(e) = self
                .transport
                .senden(RoomMessage::LeaveRoom { room_id, user_id })
                .await
            {
                debug!(fehler = %e, "leave-room nicht zustellbar");
            }
            info!(room = %room_id, "Raum verlassen");
        }
        self.zustand_setzen(SessionState::Idle);
        Ok(())
    }

    fn shutdown(&self) {
        if *self.zustand.read() == SessionState::Idle {
            return;
        }
        self.zustand_setzen(SessionState::Leaving);
        if let Some((room_id, user_id)) = self.hart_stoppen() {
            self.leave_nachreichen(room_id, user_id);
        }
        self.zustand_setzen(SessionState::Idle);
        info!("Sitzung beendet");
    }

    /// Sendet `leave-room`, ohne darauf zu warten
    fn leave_nachreichen(&self, room_id: RoomId, user_id: UserId) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        handle.spawn(async move {
            if let Err(e) = transport
                .senden(RoomMessage::LeaveRoom { room_id, user_id })
                .await
            {
                debug!(fehler = %e, "leave-room nicht zustellbar");
            }
        });
    }

    /// Gemeinsamer Abbau aller Ressourcen; liefert den verlassenen Raum
    ///
    /// Synchron: Wird dies aus einem Sitzungs-Task heraus aufgerufen, bricht
    /// der Task beim naechsten `await` ab.
    fn hart_stoppen(&self) -> Option<(RoomId, UserId)> {
        let raum = self.raum.lock().take();
        if let Some(raum) = &raum {
            raum.capture.stop();
            self.registry.callback_entfernen(raum.geraete_callback);
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        drop(tasks);

        self.sink.alle_stoppen();
        let peers = self.peers.leeren();
        self.lokal.lock().erzwingen_still();

        if let Some(m) = &self.metriken {
            m.peers_aktiv.set(0);
            m.peers_sprechend.set(0);
        }
        debug!(peers, "Sitzung hart gestoppt");
        raum.map(|r| (r.room_id, r.user_id))
    }

    async fn stumm_setzen(&self, stumm: bool) {
        if self.stumm.swap(stumm, Ordering::SeqCst) == stumm {
            return;
        }
        let raum = self
            .raum
            .lock()
            .as_ref()
            .map(|r| (Arc::clone(&r.capture), r.user_id));

        if let Some((capture, user_id)) = raum {
            capture.set_muted(stumm);
            if stumm {
                let wechsel = self.lokal.lock().erzwingen_still();
                if wechsel == Some(false) {
                    self.lokaler_sprechwechsel(user_id, false).await;
                }
            }
            if let Err(e) = self
                .transport
                .senden(RoomMessage::UserMuted {
                    user_id,
                    is_muted: stumm,
                })
                .await
            {
                debug!(fehler = %e, "user-muted nicht zustellbar");
            }
        }
        info!(stumm, "Stummschaltung geaendert");
        self.melden(SessionEvent::StummGeaendert(stumm));
    }

    async fn lokaler_sprechwechsel(&self, user_id: UserId, spricht: bool) {
        debug!(spricht, "Lokaler Sprechwechsel");
        self.melden(SessionEvent::Sprechend { user_id, spricht });
        if let Err(e) = self
            .transport
            .senden(RoomMessage::UserSpeaking {
                user_id,
                is_speaking: spricht,
            })
            .await
        {
            debug!(fehler = %e, "user-speaking nicht zustellbar");
        }
    }

    /// Entfernen oder Bannen durch einen Moderator
    fn zwangsweise_entfernt(&self, grund: Option<String>, gebannt: bool) {
        warn!(gebannt, grund = grund.as_deref().unwrap_or("-"), "Aus dem Raum entfernt");
        self.zustand_setzen(SessionState::Leaving);
        let raum = self.hart_stoppen();
        self.zustand_setzen(SessionState::Idle);

        self.melden(SessionEvent::Entfernt {
            grund: grund.clone(),
            gebannt,
        });
        let callbacks = self.entfernt_callbacks.read().clone();
        for cb in callbacks {
            cb(grund.as_deref(), gebannt);
        }
        if let Some((room_id, user_id)) = raum {
            self.leave_nachreichen(room_id, user_id);
        }
    }

    fn verbindung_verloren(&self) {
        warn!("Transport getrennt, Sitzung wird beendet");
        self.zustand_setzen(SessionState::Leaving);
        self.hart_stoppen();
        self.zustand_setzen(SessionState::Idle);
        self.melden(SessionEvent::Hinweis(
            "Verbindung zum Raum verloren".to_string(),
        ));
    }

    fn spawnen<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn sprechende_zaehlen(&self) {
        if let Some(m) = &self.metriken {
            m.peers_sprechend.set(self.peers.sprechende() as i64);
        }
    }
}

// ---------------------------------------------------------------------------
// Eingehende Nachrichten
// ---------------------------------------------------------------------------

impl SessionInner {
    async fn nachricht_verarbeiten(
        self: &Arc<Self>,
        nachricht: RoomMessage,
        room_id: RoomId,
        lokal: UserId,
    ) -> ControlFlow<()> {
        if nachricht.ist_moderation() {
            return match moderation::auswerten(&nachricht, room_id, lokal) {
                Some(Direktive::Stumm) => {
                    self.stumm_setzen(true).await;
                    self.melden(SessionEvent::Hinweis(
                        "Du wurdest von einem Moderator stummgeschaltet".to_string(),
                    ));
                    ControlFlow::Continue(())
                }
                Some(Direktive::Laut) => {
                    self.stumm_setzen(false).await;
                    self.melden(SessionEvent::Hinweis(
                        "Ein Moderator hat deine Stummschaltung aufgehoben".to_string(),
                    ));
                    ControlFlow::Continue(())
                }
                Some(Direktive::Entfernen { grund }) => {
                    self.zwangsweise_entfernt(grund, false);
                    ControlFlow::Break(())
                }
                Some(Direktive::Bannen { grund }) => {
                    self.zwangsweise_entfernt(grund, true);
                    ControlFlow::Break(())
                }
                None => ControlFlow::Continue(()),
            };
        }
        if nachricht.room_id().is_some_and(|r| r != room_id) || nachricht.user_id() == lokal {
            return ControlFlow::Continue(());
        }

        let jetzt = self.clock.jetzt();
        match nachricht {
            RoomMessage::AudioStream { user_id, audio, .. } => {
                let (neu, verworfen) = self.peers.chunk_ablegen(user_id, audio, jetzt);
                if let Some(m) = &self.metriken {
                    m.chunks_empfangen.inc();
                    if verworfen {
                        m.chunks_verworfen.inc();
                    }
                }
                if neu {
                    self.peer_beigetreten(user_id);
                }
            }
            RoomMessage::UserJoined { user_id } => {
                if self.peers.sicherstellen(user_id, jetzt) {
                    self.peer_beigetreten(user_id);
                }
            }
            RoomMessage::UserLeft { user_id } => self.peer_verlassen(user_id),
            RoomMessage::UserSpeaking {
                user_id,
                is_speaking,
            } => {
                if self.peers.sicherstellen(user_id, jetzt) {
                    self.peer_beigetreten(user_id);
                }
                if let Some(spricht) = self.peers.sprechen_setzen(user_id, is_speaking, jetzt) {
                    self.melden(SessionEvent::Sprechend { user_id, spricht });
                    self.sprechende_zaehlen();
                }
            }
            RoomMessage::UserMuted { user_id, is_muted } => {
                self.melden(SessionEvent::PeerStumm {
                    user_id,
                    stumm: is_muted,
                });
            }
            RoomMessage::SoundEffect {
                user_id, sound_url, ..
            } => {
                let inner = Arc::clone(self);
                self.spawnen(async move {
                    match inner.sound.laden_entfernt(&sound_url).await {
                        Ok(pcm) => {
                            inner.sink.abspielen(Quelle::Effekt, pcm, Duration::ZERO);
                        }
                        Err(e) => {
                            warn!(von = %user_id, url = %sound_url, fehler = %e, "Sound-Effekt nicht abspielbar")
                        }
                    }
                });
            }
            andere => debug!(typ = andere.typ(), "Nachricht ignoriert"),
        }
        ControlFlow::Continue(())
    }

    fn peer_beigetreten(&self, user_id: UserId) {
        info!(peer = %user_id, "Teilnehmer im Raum");
        if let Some(m) = &self.metriken {
            m.peers_aktiv.set(self.peers.len() as i64);
        }
        self.melden(SessionEvent::PeerBeigetreten(user_id));
    }

    fn peer_verlassen(&self, user_id: UserId) {
        let Some(peer) = self.peers.entfernen(user_id) else {
            return;
        };
        for id in peer.laufende_wiedergaben() {
            self.sink.stoppen(id);
        }
        if peer.detector.spricht() {
            self.melden(SessionEvent::Sprechend {
                user_id,
                spricht: false,
            });
        }
        if let Some(m) = &self.metriken {
            m.peers_aktiv.set(self.peers.len() as i64);
        }
        self.sprechende_zaehlen();
        info!(peer = %user_id, "Teilnehmer hat den Raum verlassen");
        self.melden(SessionEvent::PeerVerlassen(user_id));
    }
}

// ---------------------------------------------------------------------------
// Flush und Wiedergabe
// ---------------------------------------------------------------------------

impl SessionInner {
    fn flush_runde(self: &Arc<Self>) {
        let jetzt = self.clock.jetzt();
        for user_id in self.peers.ids() {
            match self.peers.flush_pruefen(user_id, jetzt) {
                FlushSchritt::Nichts => {}
                FlushSchritt::Uebersprungen => {
                    if let Some(m) = &self.metriken {
                        m.flushes_uebersprungen.inc();
                    }
                }
                FlushSchritt::Einheit {
                    einheit,
                    pipeline,
                    epoche,
                    anschluss,
                } => {
                    if let Some(m) = &self.metriken {
                        m.flushes.with_label_values(&[einheit.grund.als_str()]).inc();
                        m.flush_einheit_sekunden.observe(
                            (einheit.chunks.len() as u64 * self.config.puffer.chunk_ms) as f64
                                / 1000.0,
                        );
                    }
                    debug!(
                        peer = %user_id,
                        chunks = einheit.chunks.len(),
                        grund = einheit.grund.als_str(),
                        "Flush"
                    );
                    self.spawnen(einheit_abspielen(
                        Arc::clone(self),
                        user_id,
                        epoche,
                        pipeline,
                        einheit,
                        anschluss,
                    ));
                }
            }
        }
    }
}

async fn einheit_abspielen(
    inner: Arc<SessionInner>,
    user_id: UserId,
    epoche: u64,
    pipeline: PeerPipeline,
    einheit: FlushEinheit,
    anschluss: Option<Instant>,
) {
    let Some((pipeline, ergebnis)) =
        einheit_verarbeiten(pipeline, einheit.chunks, inner.config.wiedergabe.dekodier_pool).await
    else {
        inner.peers.dekodierung_beendet(user_id, epoche, None);
        return;
    };

    match ergebnis {
        Ok(Some(pcm)) => {
            let jetzt = inner.clock.jetzt();
            // Lueckenlos hinter der laufenden Einheit, sonst nach der Latenz
            let verzoegerung = anschluss
                .map(|ende| ende.saturating_duration_since(jetzt))
                .unwrap_or_default()
                .max(inner.config.wiedergabe.latenz());
            let dauer = Duration::from_secs_f64(
                pcm.len() as f64 / inner.config.wiedergabe.ausgabe.sample_rate.max(1) as f64,
            );
            let handle = inner.sink.abspielen(Quelle::Peer(user_id), pcm, verzoegerung);
            let wiedergabe = Wiedergabe {
                id: handle.id,
                ende: jetzt + verzoegerung + dauer,
            };
            if !inner
                .peers
                .wiedergabe_gestartet(user_id, epoche, wiedergabe, pipeline)
            {
                inner.sink.stoppen(handle.id);
                return;
            }
            // Gestoppte Wiedergaben liefern einen Fehler; beides gibt den Peer frei
            let _ = handle.fertig.await;
            inner.peers.wiedergabe_beendet(user_id, epoche, wiedergabe.id);
        }
        Ok(None) => inner.peers.dekodierung_beendet(user_id, epoche, Some(pipeline)),
        Err(e) => {
            warn!(peer = %user_id, fehler = %e, "Einheit nicht dekodierbar, verworfen");
            if let Some(m) = &inner.metriken {
                m.dekodierfehler.inc();
            }
            inner.peers.dekodierung_beendet(user_id, epoche, Some(pipeline));
        }
    }
}

// ---------------------------------------------------------------------------
// Hintergrund-Tasks
// ---------------------------------------------------------------------------

async fn chunks_senden(inner: Arc<SessionInner>, mut rx: mpsc::UnboundedReceiver<EncodedChunk>) {
    while let Some(chunk) = rx.recv().await {
        // Vor dem Stummschalten kodierte Chunks bleiben liegen
        if inner.stumm.load(Ordering::SeqCst) {
            continue;
        }
        let nachricht = RoomMessage::AudioStream {
            room_id: chunk.room_id,
            user_id: chunk.user_id,
            audio: chunk.audio,
        };
        match inner.transport.senden(nachricht).await {
            Ok(()) => {
                if let Some(m) = &inner.metriken {
                    m.chunks_gesendet.inc();
                }
            }
            Err(e) => debug!(fehler = %e, "Chunk nicht zustellbar"),
        }
    }
}

async fn eingang_verarbeiten(
    inner: Arc<SessionInner>,
    mut eingang: broadcast::Receiver<TransportEreignis>,
    room_id: RoomId,
    lokal: UserId,
) {
    loop {
        match eingang.recv().await {
            Ok(TransportEreignis::Nachricht(nachricht)) => {
                if inner
                    .nachricht_verarbeiten(nachricht, room_id, lokal)
                    .await
                    .is_break()
                {
                    break;
                }
            }
            Ok(TransportEreignis::Getrennt) | Err(broadcast::error::RecvError::Closed) => {
                inner.verbindung_verloren();
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(verpasst = n, "Eingang ueberlastet, Nachrichten verloren");
            }
        }
    }
}

async fn flush_takt(inner: Arc<SessionInner>) {
    let mut takt = tokio::time::interval(inner.config.puffer.tick());
    takt.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        takt.tick().await;
        inner.flush_runde();
    }
}

async fn sprecher_takt(inner: Arc<SessionInner>, capture: Arc<CaptureSession>, user_id: UserId) {
    let mut takt = tokio::time::interval(Duration::from_millis(inner.config.sprecher.tick_ms));
    takt.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        takt.tick().await;
        let wechsel = inner.lokal.lock().messen(capture.letzter_pegel());
        if let Some(spricht) = wechsel {
            inner.lokaler_sprechwechsel(user_id, spricht).await;
        }
    }
}

async fn geraete_beobachten(
    inner: Arc<SessionInner>,
    mut rx: mpsc::UnboundedReceiver<bool>,
    room_id: RoomId,
    user_id: UserId,
) {
    while let Some(eingang_betroffen) = rx.recv().await {
        if !eingang_betroffen || *inner.zustand.read() != SessionState::Active {
            continue;
        }
        if inner.wechsel_laeuft.swap(true, Ordering::SeqCst) {
            continue;
        }
        // Eigener Task: `leave` bricht diesen hier ab
        tokio::spawn(neu_aufbauen(Arc::clone(&inner), room_id, user_id));
    }
}

/// Hot-Swap: genau ein `leave` und ein `join` mit demselben Raum
///
/// Geboxt, weil `join` diesen Task indirekt selbst wieder startet.
fn neu_aufbauen(
    inner: Arc<SessionInner>,
    room_id: RoomId,
    user_id: UserId,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        info!("Eingabegeraet geaendert, Sitzung wird neu aufgebaut");
        let ergebnis = match inner.leave().await {
            Ok(()) => inner.join(room_id, user_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = ergebnis {
            warn!(fehler = %e, "Neuaufbau nach Geraetewechsel fehlgeschlagen");
            inner.melden(SessionEvent::Hinweis(format!(
                "Audio nach Geraetewechsel nicht verfuegbar: {e}"
            )));
        }
        inner.wechsel_laeuft.store(false, Ordering::SeqCst);
    })
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(raum) = self.raum.get_mut().take() {
            raum.capture.stop();
            self.registry.callback_entfernen(raum.geraete_callback);
        }
    }
}
