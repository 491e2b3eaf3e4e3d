//! huddle-voice – Client-seitige Voice-Engine
//!
//! Setzt Capture, Transport und Wiedergabe zu einer Raum-Sitzung zusammen.
//!
//! ## Module
//! - [`speaker_buffer`] – Jitter-Puffer je Teilnehmer (Ziel-Dauer / Max-Warten)
//! - [`playback`] – Dekodierung und Effektkette einer Flush-Einheit
//! - [`detector`] – Sprecher-Erkennung mit Hysterese
//! - [`state`] – Peer-Arena aller Teilnehmer
//! - [`moderation`] – Moderations-Direktiven senden und auswerten
//! - [`transport`] – Transport-Trait, TCP- und In-Memory-Implementierung
//! - [`session`] – Zustandsmaschine `Idle -> Joining -> Active -> Leaving`
//! - [`config`] – TOML-Konfiguration der Engine

pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod moderation;
pub mod playback;
pub mod session;
pub mod speaker_buffer;
pub mod state;
pub mod transport;

pub use clock::TokioClock;
pub use config::HuddleConfig;
pub use detector::{DetectorConfig, SpeakingDetector, SprechZustand};
pub use error::{VoiceError, VoiceResult};
pub use moderation::{Direktive, ModerationChannel};
pub use session::{AudioSession, EntferntCallback, SessionBausteine, SessionEvent, SessionState};
pub use speaker_buffer::{FlushEinheit, FlushGrund, SpeakerBuffer, SpeakerBufferConfig};
pub use state::PeerInfo;
pub use transport::{ChannelTransport, TcpTransport, Transport, TransportEreignis, TransportGegenstelle};
