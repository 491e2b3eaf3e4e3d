//! Fehlertypen fuer Huddle
//!
//! Zentraler Fehler-Enum fuer alles, was crate-uebergreifend gemeldet wird.
//! Audio- und Voice-Crate definieren eigene Fehler und konvertieren bei
//! Bedarf in diesen Typ.

use thiserror::Error;

/// Globaler Result-Alias fuer Huddle
pub type Result<T> = std::result::Result<T, HuddleError>;

/// Grobe Fehlerkategorie, die Hosts fuer Benutzerhinweise auswerten koennen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FehlerKategorie {
    Berechtigung,
    Geraet,
    Transport,
    Codec,
    Konfiguration,
    Intern,
}

/// Alle Fehler, die ein Host von der Voice-Engine sehen kann
#[derive(Debug, Error)]
pub enum HuddleError {
    // --- Geraete ---
    #[error("Zugriff auf Mikrofon verweigert: {0}")]
    ZugriffVerweigert(String),

    #[error("Geraet nicht gefunden: {0}")]
    GeraetNichtGefunden(String),

    #[error("Geraet wird bereits verwendet: {0}")]
    GeraetBelegt(String),

    // --- Transport ---
    #[error("Transport nicht verfuegbar: {0}")]
    TransportNichtVerfuegbar(String),

    // --- Codec ---
    #[error("Dekodierung fehlgeschlagen: {0}")]
    Dekodierung(String),

    #[error("Kodierung fehlgeschlagen: {0}")]
    Kodierung(String),

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl HuddleError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    pub fn kategorie(&self) -> FehlerKategorie {
        match self {
            Self::ZugriffVerweigert(_) => FehlerKategorie::Berechtigung,
            Self::GeraetNichtGefunden(_) | Self::GeraetBelegt(_) => FehlerKategorie::Geraet,
            Self::TransportNichtVerfuegbar(_) => FehlerKategorie::Transport,
            Self::Dekodierung(_) | Self::Kodierung(_) => FehlerKategorie::Codec,
            Self::Konfiguration(_) => FehlerKategorie::Konfiguration,
            Self::Intern(_) | Self::Anyhow(_) => FehlerKategorie::Intern,
        }
    }

    /// Ein erneuter Versuch kann sinnvoll sein (Geraet frei geworden, Netz wieder da)
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(
            self,
            Self::GeraetBelegt(_) | Self::TransportNichtVerfuegbar(_)
        )
    }
}
