//! Identifikationstypen fuer Huddle
//!
//! Benutzer und Raeume werden ueber UUID-Newtypes adressiert, damit eine
//! RoomId nie versehentlich als UserId durchgereicht werden kann.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $praefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Erstellt eine neue zufaellige ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Gibt die innere UUID zurueck
            pub fn inner(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($praefix, ":{}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            /// Akzeptiert sowohl die nackte UUID als auch die Display-Form mit Praefix
            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let roh = s.strip_prefix(concat!($praefix, ":")).unwrap_or(s);
                Uuid::parse_str(roh).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Eindeutige Benutzer-ID
    UserId,
    "user"
);

uuid_id!(
    /// Eindeutige Raum-ID (ein Raum = eine Audio-Session)
    RoomId,
    "room"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_eindeutig() {
        let a = UserId::new();
        let b = UserId::new();
        assert_ne!(a, b, "Zwei neue UserIds muessen verschieden sein");
    }

    #[test]
    fn room_id_display_mit_praefix() {
        let id = RoomId(Uuid::nil());
        assert_eq!(id.to_string(), format!("room:{}", Uuid::nil()));
    }

    #[test]
    fn parse_akzeptiert_praefix_und_nackte_uuid() {
        let uuid = Uuid::new_v4();
        let a: UserId = format!("user:{uuid}").parse().unwrap();
        let b: UserId = uuid.to_string().parse().unwrap();
        assert_eq!(a, b);
        assert!("kein-uuid".parse::<RoomId>().is_err());
    }

    #[test]
    fn serde_ist_transparent() {
        let uid = UserId(Uuid::nil());
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, format!("\"{}\"", Uuid::nil()));
        let zurueck: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(uid, zurueck);
    }
}
