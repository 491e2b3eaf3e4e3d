//! Raum-Nachrichten
//!
//! Alle Nachrichten, die zwischen Client und Raum-Server ueber den Transport
//! fliessen. Das JSON-Format ist ein getaggter Enum (`"type": "audio-stream"`)
//! mit camelCase-Feldern; Audio-Nutzdaten werden base64-kodiert.

use base64::Engine as _;
use huddle_core::types::{RoomId, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// RoomMessage
// ---------------------------------------------------------------------------

/// Eine Nachricht auf dem Raum-Transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RoomMessage {
    JoinRoom {
        room_id: RoomId,
        user_id: UserId,
    },
    LeaveRoom {
        room_id: RoomId,
        user_id: UserId,
    },
    /// Ein kodierter Audio-Chunk (10 ms Opus)
    AudioStream {
        room_id: RoomId,
        user_id: UserId,
        #[serde(with = "base64_bytes")]
        audio: Vec<u8>,
    },
    UserSpeaking {
        user_id: UserId,
        is_speaking: bool,
    },
    /// Informativ, wird bei jeder lokalen Mute-Aenderung gesendet
    UserMuted {
        user_id: UserId,
        is_muted: bool,
    },
    UserJoined {
        user_id: UserId,
    },
    UserLeft {
        user_id: UserId,
    },
    SoundEffect {
        room_id: RoomId,
        user_id: UserId,
        sound_url: String,
    },

    // --- Moderation ---
    ForceMute {
        room_id: RoomId,
        target_user_id: UserId,
    },
    ForceUnmute {
        room_id: RoomId,
        target_user_id: UserId,
    },
    ForceRemove {
        room_id: RoomId,
        target_user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ForceBan {
        room_id: RoomId,
        target_user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl RoomMessage {
    /// Kurzname des Nachrichtentyps (fuer Logs)
    pub fn typ(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::AudioStream { .. } => "audio-stream",
            Self::UserSpeaking { .. } => "user-speaking",
            Self::UserMuted { .. } => "user-muted",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::SoundEffect { .. } => "sound-effect",
            Self::ForceMute { .. } => "force-mute",
            Self::ForceUnmute { .. } => "force-unmute",
            Self::ForceRemove { .. } => "force-remove",
            Self::ForceBan { .. } => "force-ban",
        }
    }

    /// Raum, auf den sich die Nachricht bezieht (falls sie einen traegt)
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::LeaveRoom { room_id, .. }
            | Self::AudioStream { room_id, .. }
            | Self::SoundEffect { room_id, .. }
            | Self::ForceMute { room_id, .. }
            | Self::ForceUnmute { room_id, .. }
            | Self::ForceRemove { room_id, .. }
            | Self::ForceBan { room_id, .. } => Some(*room_id),
            Self::UserSpeaking { .. }
            | Self::UserMuted { .. }
            | Self::UserJoined { .. }
            | Self::UserLeft { .. } => None,
        }
    }

    /// Absender bzw. betroffener Benutzer
    ///
    /// Bei Moderations-Direktiven ist das der Zielbenutzer.
    pub fn user_id(&self) -> UserId {
        match self {
            Self::JoinRoom { user_id, .. }
            | Self::LeaveRoom { user_id, .. }
            | Self::AudioStream { user_id, .. }
            | Self::UserSpeaking { user_id, .. }
            | Self::UserMuted { user_id, .. }
            | Self::UserJoined { user_id }
            | Self::UserLeft { user_id }
            | Self::SoundEffect { user_id, .. } => *user_id,
            Self::ForceMute { target_user_id, .. }
            | Self::ForceUnmute { target_user_id, .. }
            | Self::ForceRemove { target_user_id, .. }
            | Self::ForceBan { target_user_id, .. } => *target_user_id,
        }
    }

    pub fn ist_moderation(&self) -> bool {
        matches!(
            self,
            Self::ForceMute { .. }
                | Self::ForceUnmute { .. }
                | Self::ForceRemove { .. }
                | Self::ForceBan { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// base64 fuer Audio-Bytes
// ---------------------------------------------------------------------------

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
