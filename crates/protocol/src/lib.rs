//! huddle-protocol – Nachrichtenmodell und Wire-Format
//!
//! Definiert die Raum-Nachrichten, die zwischen Client und Raum-Server
//! ausgetauscht werden, deren Frame-Kodierung fuer TCP sowie die
//! gemeinsame Opus-Konfiguration.

pub mod codec;
pub mod room;
pub mod wire;

pub use codec::{OpusApplication, OpusConfig};
pub use room::RoomMessage;
pub use wire::FrameCodec;
