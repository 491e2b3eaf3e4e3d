//! Moderations-Kanal
//!
//! Ausgehend sind die Direktiven reine Transport-Nachrichten, die nur der
//! Raumbesitzer senden darf. Eingehend filtert [`auswerten`] alles heraus,
//! was nicht den lokalen Benutzer im eigenen Raum betrifft; die Wirkung
//! (Stummschalten, Abbau der Sitzung) uebernimmt die `AudioSession`.

use huddle_core::types::{RoomId, UserId};
use huddle_protocol::RoomMessage;
use std::sync::Arc;

use crate::error::{VoiceError, VoiceResult};
use crate::transport::Transport;

/// Eine an den lokalen Benutzer gerichtete Direktive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direktive {
    Stumm,
    Laut,
    Entfernen { grund: Option<String> },
    Bannen { grund: Option<String> },
}

impl Direktive {
    /// Entfernen und Bannen beenden die Sitzung
    pub fn ist_endgueltig(&self) -> bool {
        matches!(self, Direktive::Entfernen { .. } | Direktive::Bannen { .. })
    }
}

/// Prueft, ob `nachricht` eine Direktive fuer `lokal` in `room_id` ist
pub fn auswerten(nachricht: &RoomMessage, room_id: RoomId, lokal: UserId) -> Option<Direktive> {
    if !nachricht.ist_moderation()
        || nachricht.room_id() != Some(room_id)
        || nachricht.user_id() != lokal
    {
        return None;
    }
    match nachricht {
        RoomMessage::ForceMute { .. } => Some(Direktive::Stumm),
        RoomMessage::ForceUnmute { .. } => Some(Direktive::Laut),
        RoomMessage::ForceRemove { reason, .. } => Some(Direktive::Entfernen {
            grund: reason.clone(),
        }),
        RoomMessage::ForceBan { reason, .. } => Some(Direktive::Bannen {
            grund: reason.clone(),
        }),
        _ => None,
    }
}

/// Sendet Moderations-Direktiven in einen Raum
pub struct ModerationChannel {
    transport: Arc<dyn Transport>,
    room_id: RoomId,
    besitzer: bool,
}

impl ModerationChannel {
    pub fn neu(transport: Arc<dyn Transport>, room_id: RoomId, besitzer: bool) -> Self {
        Self {
            transport,
            room_id,
            besitzer,
        }
    }

    pub fn ist_besitzer(&self) -> bool {
        self.besitzer
    }

    pub async fn force_mute(&self, ziel: UserId) -> VoiceResult<()> {
        self.senden(RoomMessage::ForceMute {
            room_id: self.room_id,
            target_user_id: ziel,
        })
        .await
    }

    pub async fn force_unmute(&self, ziel: UserId) -> VoiceResult<()> {
        self.senden(RoomMessage::ForceUnmute {
            room_id: self.room_id,
            target_user_id: ziel,
        })
        .await
    }

    pub async fn force_remove(&self, ziel: UserId, grund: Option<String>) -> VoiceResult<()> {
        self.senden(RoomMessage::ForceRemove {
            room_id: self.room_id,
            target_user_id: ziel,
            reason: grund,
        })
        .await
    }

    pub async fn force_ban(&self, ziel: UserId, grund: Option<String>) -> VoiceResult<()> {
        self.senden(RoomMessage::ForceBan {
            room_id: self.room_id,
            target_user_id: ziel,
            reason: grund,
        })
        .await
    }

    async fn senden(&self, nachricht: RoomMessage) -> VoiceResult<()> {
        if !self.besitzer {
            tracing::warn!(
                typ = nachricht.typ(),
                "Moderation ohne Besitzerrechte abgelehnt"
            );
            return Err(VoiceError::KeineBerechtigung);
        }
        tracing::info!(
            typ = nachricht.typ(),
            ziel = %nachricht.user_id(),
            "Moderations-Direktive gesendet"
        );
        self.transport.senden(nachricht).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    #[tokio::test]
    async fn besitzer_sendet_direktiven() {
        let (transport, mut gegenstelle) = ChannelTransport::neu();
        let room_id = RoomId::new();
        let ziel = UserId::new();
        let kanal = ModerationChannel::neu(Arc::new(transport), room_id, true);

        kanal.force_mute(ziel).await.unwrap();
        kanal.force_ban(ziel, Some("Spam".into())).await.unwrap();

        assert_eq!(
            gegenstelle.gesendete(),
            vec![
                RoomMessage::ForceMute {
                    room_id,
                    target_user_id: ziel
                },
                RoomMessage::ForceBan {
                    room_id,
                    target_user_id: ziel,
                    reason: Some("Spam".into())
                },
            ]
        );
    }

    #[tokio::test]
    async fn ohne_besitz_keine_direktive() {
        let (transport, mut gegenstelle) = ChannelTransport::neu();
        let kanal = ModerationChannel::neu(Arc::new(transport), RoomId::new(), false);

        assert!(matches!(
            kanal.force_remove(UserId::new(), None).await,
            Err(VoiceError::KeineBerechtigung)
        ));
        assert!(gegenstelle.gesendete().is_empty());
    }

    #[test]
    fn fremde_ziele_und_raeume_ignoriert() {
        let raum = RoomId::new();
        let ich = UserId::new();

        let an_mich = RoomMessage::ForceRemove {
            room_id: raum,
            target_user_id: ich,
            reason: None,
        };
        assert_eq!(
            auswerten(&an_mich, raum, ich),
            Some(Direktive::Entfernen { grund: None })
        );

        let an_andere = RoomMessage::ForceMute {
            room_id: raum,
            target_user_id: UserId::new(),
        };
        assert_eq!(auswerten(&an_andere, raum, ich), None);

        let anderer_raum = RoomMessage::ForceBan {
            room_id: RoomId::new(),
            target_user_id: ich,
            reason: None,
        };
        assert_eq!(auswerten(&anderer_raum, raum, ich), None);

        let keine_moderation = RoomMessage::UserLeft { user_id: ich };
        assert_eq!(auswerten(&keine_moderation, raum, ich), None);
    }

    #[test]
    fn endgueltige_direktiven() {
        assert!(!Direktive::Stumm.ist_endgueltig());
        assert!(Direktive::Bannen { grund: None }.ist_endgueltig());
    }
}
