//! Transport – Nachrichtenkanal zum Raum
//!
//! Die Sitzung kennt nur das [`Transport`]-Trait. Produktion nutzt
//! [`TcpTransport`] (laengenpraefixierte JSON-Frames ueber
//! `tokio_util::codec::Framed`), Tests und einbettende Hosts den
//! [`ChannelTransport`] im Speicher.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{wire::FrameCodec, RoomMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::error::{VoiceError, VoiceResult};

/// Kapazitaet des Eingangs-Broadcasts
const EINGANG_KAPAZITAET: usize = 1024;

/// Eingehende Ereignisse eines Transports
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEreignis {
    Nachricht(RoomMessage),
    /// Verbindung ist weg; es folgen keine weiteren Nachrichten
    Getrennt,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sendet eine Nachricht an den Raum
    async fn senden(&self, nachricht: RoomMessage) -> VoiceResult<()>;

    /// Neuer Empfaenger fuer alle ab jetzt eingehenden Ereignisse
    fn abonnieren(&self) -> broadcast::Receiver<TransportEreignis>;

    fn ist_verbunden(&self) -> bool;
}

// ---------------------------------------------------------------------------
// ChannelTransport
// ---------------------------------------------------------------------------

/// In-Memory-Transport; die Gegenseite haelt die [`TransportGegenstelle`]
pub struct ChannelTransport {
    ausgang: mpsc::UnboundedSender<RoomMessage>,
    eingang: broadcast::Sender<TransportEreignis>,
    verbunden: Arc<AtomicBool>,
}

/// Server-Seite eines [`ChannelTransport`]
pub struct TransportGegenstelle {
    gesendet: mpsc::UnboundedReceiver<RoomMessage>,
    eingang: broadcast::Sender<TransportEreignis>,
    verbunden: Arc<AtomicBool>,
}

impl ChannelTransport {
    pub fn neu() -> (Self, TransportGegenstelle) {
        let (ausgang, gesendet) = mpsc::unbounded_channel();
        let (eingang, _) = broadcast::channel(EINGANG_KAPAZITAET);
        let verbunden = Arc::new(AtomicBool::new(true));
        (
            Self {
                ausgang,
                eingang: eingang.clone(),
                verbunden: Arc::clone(&verbunden),
            },
            TransportGegenstelle {
                gesendet,
                eingang,
                verbunden,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn senden(&self, nachricht: RoomMessage) -> VoiceResult<()> {
        if !self.ist_verbunden() {
            return Err(VoiceError::TransportNichtVerfuegbar(
                "Kanal getrennt".to_string(),
            ));
        }
        self.ausgang.send(nachricht).map_err(|_| {
            VoiceError::TransportNichtVerfuegbar("Gegenstelle geschlossen".to_string())
        })
    }

    fn abonnieren(&self) -> broadcast::Receiver<TransportEreignis> {
        self.eingang.subscribe()
    }

    fn ist_verbunden(&self) -> bool {
        self.verbunden.load(Ordering::SeqCst)
    }
}

impl TransportGegenstelle {
    /// Stellt eine Nachricht zu, als kaeme sie vom Server
    pub fn einspeisen(&self, nachricht: RoomMessage) {
        let _ = self.eingang.send(TransportEreignis::Nachricht(nachricht));
    }

    /// Trennt die Verbindung
    pub fn trennen(&self) {
        self.verbunden.store(false, Ordering::SeqCst);
        let _ = self.eingang.send(TransportEreignis::Getrennt);
    }

    /// Alle bisher gesendeten, noch nicht abgeholten Nachrichten
    pub fn gesendete(&mut self) -> Vec<RoomMessage> {
        let mut alle = Vec::new();
        while let Ok(n) = self.gesendet.try_recv() {
            alle.push(n);
        }
        alle
    }

    /// Wartet auf die naechste gesendete Nachricht
    pub async fn naechste(&mut self) -> Option<RoomMessage> {
        self.gesendet.recv().await
    }
}

// ---------------------------------------------------------------------------
// TcpTransport
// ---------------------------------------------------------------------------

/// Transport ueber eine TCP-Verbindung mit `FrameCodec`
pub struct TcpTransport {
    ausgang: mpsc::Sender<RoomMessage>,
    eingang: broadcast::Sender<TransportEreignis>,
    verbunden: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TcpTransport {
    /// Baut die Verbindung auf und startet den Verbindungs-Task
    pub async fn verbinden(adresse: &str) -> VoiceResult<Self> {
        let stream = TcpStream::connect(adresse).await.map_err(|e| {
            VoiceError::TransportNichtVerfuegbar(format!("{adresse}: {e}"))
        })?;
        stream.set_nodelay(true)?;
        tracing::info!(adresse, "Transport verbunden");
        Ok(Self::aus_stream(stream))
    }

    /// Uebernimmt eine bestehende Verbindung
    pub fn aus_stream(stream: TcpStream) -> Self {
        let (ausgang, sende_rx) = mpsc::channel::<RoomMessage>(256);
        let (eingang, _) = broadcast::channel(EINGANG_KAPAZITAET);
        let verbunden = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(verbindung_betreiben(
            Framed::new(stream, FrameCodec::new()),
            sende_rx,
            eingang.clone(),
            Arc::clone(&verbunden),
        ));

        Self {
            ausgang,
            eingang,
            verbunden,
            task,
        }
    }
}

async fn verbindung_betreiben(
    mut framed: Framed<TcpStream, FrameCodec>,
    mut sende_rx: mpsc::Receiver<RoomMessage>,
    eingang: broadcast::Sender<TransportEreignis>,
    verbunden: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            frame = framed.next() => {
                match frame {
                    Some(Ok(nachricht)) => {
                        tracing::trace!(typ = nachricht.typ(), "Nachricht empfangen");
                        let _ = eingang.send(TransportEreignis::Nachricht(nachricht));
                    }
                    Some(Err(e)) => {
                        tracing::warn!(fehler = %e, "Frame-Lesefehler");
                        break;
                    }
                    None => {
                        tracing::info!("Verbindung vom Server getrennt");
                        break;
                    }
                }
            }
            ausgehend = sende_rx.recv() => {
                let Some(nachricht) = ausgehend else { break };
                if let Err(e) = framed.send(nachricht).await {
                    tracing::warn!(fehler = %e, "Senden fehlgeschlagen");
                    break;
                }
            }
        }
    }
    verbunden.store(false, Ordering::SeqCst);
    let _ = eingang.send(TransportEreignis::Getrennt);
}

#[async_trait]
impl Transport for TcpTransport {
    async fn senden(&self, nachricht: RoomMessage) -> VoiceResult<()> {
        if !self.ist_verbunden() {
            return Err(VoiceError::TransportNichtVerfuegbar(
                "Verbindung getrennt".to_string(),
            ));
        }
        self.ausgang.send(nachricht).await.map_err(|_| {
            VoiceError::TransportNichtVerfuegbar("Verbindungs-Task beendet".to_string())
        })
    }

    fn abonnieren(&self) -> broadcast::Receiver<TransportEreignis> {
        self.eingang.subscribe()
    }

    fn ist_verbunden(&self) -> bool {
        self.verbunden.load(Ordering::SeqCst)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}
