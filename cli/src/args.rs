//! Kommandozeilen-Argumente und Eingabezeilen
//!
//! ```text
//! huddle [--config PFAD] [--headless] geraete
//! huddle [--config PFAD] [--headless] beitreten <RAUM> [BENUTZER]
//! ```

use clap::{Parser, Subcommand};
use huddle_core::types::{RoomId, UserId};

#[derive(Debug, Parser)]
#[command(name = "huddle", version, about = "Sprachraum-Client")]
pub struct Argumente {
    /// Pfad zur Konfigurationsdatei
    #[arg(short, long, env = "HUDDLE_CONFIG")]
    pub config: Option<String>,

    /// Virtuelle Geraete statt Audio-Hardware
    #[arg(long)]
    pub headless: bool,

    #[command(subcommand)]
    pub befehl: Befehl,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Befehl {
    /// Ein- und Ausgabegeraete auflisten
    Geraete,
    /// Einem Raum beitreten
    Beitreten {
        raum: RoomId,
        /// Ohne Angabe wird eine neue ID erzeugt
        benutzer: Option<UserId>,
    },
}

/// Eine Eingabezeile waehrend der Sitzung
#[derive(Debug, Clone, PartialEq)]
pub enum Eingabe {
    Stumm,
    Laut,
    Sound(String),
    Lautstaerke(f32),
    /// Eingabegeraet wechseln
    Eingang(String),
    /// Ausgabegeraet wechseln
    Ausgabe(String),
    Peers,
    Metriken,
    Verlassen,
    Hilfe,
    Unbekannt(String),
}

impl Eingabe {
    pub fn parsen(zeile: &str) -> Option<Self> {
        let mut teile = zeile.split_whitespace();
        let befehl = teile.next()?;
        Some(match befehl {
            "stumm" | "m" => Eingabe::Stumm,
            "laut" | "u" => Eingabe::Laut,
            "sound" => match teile.next() {
                Some(url) => Eingabe::Sound(url.to_string()),
                None => Eingabe::Unbekannt(zeile.to_string()),
            },
            "lautstaerke" => match teile.next().and_then(|w| w.parse().ok()) {
                Some(wert) => Eingabe::Lautstaerke(wert),
                None => Eingabe::Unbekannt(zeile.to_string()),
            },
            "eingang" | "ausgabe" => match teile.next() {
                Some(id) if befehl == "eingang" => Eingabe::Eingang(id.to_string()),
                Some(id) => Eingabe::Ausgabe(id.to_string()),
                None => Eingabe::Unbekannt(zeile.to_string()),
            },
            "peers" => Eingabe::Peers,
            "metriken" => Eingabe::Metriken,
            "verlassen" | "q" => Eingabe::Verlassen,
            "hilfe" | "?" => Eingabe::Hilfe,
            _ => Eingabe::Unbekannt(zeile.to_string()),
        })
    }
}

pub const HILFE: &str = "\
Befehle: stumm | laut | sound <url> | lautstaerke <0.0-1.0> | eingang <id> | ausgabe <id> | \
peers | metriken | verlassen";
