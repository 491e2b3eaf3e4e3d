//! Fehlertypen der Voice-Engine

use huddle_audio::AudioError;
use huddle_core::HuddleError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("Transport nicht verfuegbar: {0}")]
    TransportNichtVerfuegbar(String),

    #[error("Aktion im Zustand {0} nicht moeglich")]
    FalscherZustand(String),

    #[error("Keine Moderationsrechte in diesem Raum")]
    KeineBerechtigung,

    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

pub type VoiceResult<T> = Result<T, VoiceError>;

impl VoiceError {
    /// Beim Beitreten: Fehler stammt vom Mikrofon bzw. Geraet
    pub fn ist_geraetefehler(&self) -> bool {
        matches!(
            self,
            VoiceError::Audio(
                AudioError::ZugriffVerweigert(_)
                    | AudioError::GeraetNichtGefunden(_)
                    | AudioError::GeraetBelegt(_)
                    | AudioError::KeinStandardEingabegeraet
            )
        )
    }
}

impl From<VoiceError> for HuddleError {
    fn from(e: VoiceError) -> Self {
        match e {
            VoiceError::Audio(a) => a.into(),
            VoiceError::TransportNichtVerfuegbar(m) => HuddleError::TransportNichtVerfuegbar(m),
            VoiceError::Konfiguration(m) => HuddleError::Konfiguration(m),
            andere => HuddleError::Intern(andere.to_string()),
        }
    }
}
