//! huddle-core – Gemeinsame Typen, Fehler und Zeitquelle
//!
//! Fundamentale Bausteine, die von allen anderen Huddle-Crates
//! gemeinsam genutzt werden.

pub mod clock;
pub mod error;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FehlerKategorie, HuddleError, Result};
pub use types::{RoomId, UserId};
