//! Fehlertypen fuer die Audio-Engine

use huddle_core::HuddleError;
use thiserror::Error;

/// Alle moeglichen Fehler der Audio-Engine
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Zugriff auf Audio-Geraet verweigert: {0}")]
    ZugriffVerweigert(String),

    #[error("Audio-Geraet nicht gefunden: {0}")]
    GeraetNichtGefunden(String),

    #[error("Audio-Geraet wird bereits verwendet: {0}")]
    GeraetBelegt(String),

    #[error("Kein Standard-Eingabegeraet verfuegbar")]
    KeinStandardEingabegeraet,

    #[error("Kein Standard-Ausgabegeraet verfuegbar")]
    KeinStandardAusgabegeraet,

    #[error("Stream-Fehler: {0}")]
    StreamFehler(String),

    #[error("Kodierung fehlgeschlagen: {0}")]
    KodierFehler(String),

    #[error("Dekodierung fehlgeschlagen: {0}")]
    DekodierFehler(String),

    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("Sound-Effekt konnte nicht geladen werden: {0}")]
    SoundLaden(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unerwarteter Fehler: {0}")]
    Anyhow(#[from] anyhow::Error),
}

pub type AudioResult<T> = Result<T, AudioError>;

impl From<AudioError> for HuddleError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::ZugriffVerweigert(m) => HuddleError::ZugriffVerweigert(m),
            AudioError::GeraetNichtGefunden(m) => HuddleError::GeraetNichtGefunden(m),
            AudioError::KeinStandardEingabegeraet | AudioError::KeinStandardAusgabegeraet => {
                HuddleError::GeraetNichtGefunden(e.to_string())
            }
            AudioError::GeraetBelegt(m) => HuddleError::GeraetBelegt(m),
            AudioError::KodierFehler(m) => HuddleError::Kodierung(m),
            AudioError::DekodierFehler(m) => HuddleError::Dekodierung(m),
            AudioError::Konfiguration(m) => HuddleError::Konfiguration(m),
            AudioError::Anyhow(a) => HuddleError::Anyhow(a),
            andere => HuddleError::Intern(andere.to_string()),
        }
    }
}
