//! Speaker Buffer – Jitter-Puffer pro Teilnehmer
//!
//! Sammelt eingehende Audio-Chunks eines Teilnehmers in Ankunftsreihenfolge
//! und gibt sie als zusammenhaengende Flush-Einheiten zur Wiedergabe frei:
//! - **Ziel**: sobald die geschaetzte Dauer `ziel_ms` erreicht
//! - **Max-Warten**: spaetestens `max_warten_ms` nach Ankunft des aeltesten Chunks
//!
//! Nur die erste Einheit eines Schubs ist auf `ziel_ms` begrenzt. Nach einem
//! uebersprungenen Flush oder nach Ablauf der Frist geht die ganze Queue raus.
//!
//! Es wird nicht umsortiert; die Transportschicht liefert pro Teilnehmer
//! geordnet. Der Puffer ist pro Teilnehmer und nicht thread-safe
//! (Synchronisation erfolgt im Peer-Arena der Sitzung).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration des Speaker Buffers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerBufferConfig {
    /// Ziel-Dauer einer Flush-Einheit in Millisekunden
    pub ziel_ms: u64,
    /// Maximale Wartezeit des aeltesten Chunks in Millisekunden
    pub max_warten_ms: u64,
    /// Maximale Anzahl gepufferter Chunks
    pub kapazitaet: usize,
    /// Nominelle Dauer eines Chunks in Millisekunden
    pub chunk_ms: u64,
}

impl Default for SpeakerBufferConfig {
    fn default() -> Self {
        Self {
            ziel_ms: 150,
            max_warten_ms: 500,
            kapazitaet: 100,
            chunk_ms: 10,
        }
    }
}

impl SpeakerBufferConfig {
    /// Chunks einer Ziel-Einheit: ceil(ziel / chunk)
    pub fn chunks_pro_einheit(&self) -> usize {
        let chunk = self.chunk_ms.max(1);
        (self.ziel_ms.div_ceil(chunk)).max(1) as usize
    }

    /// Takt des globalen Flush-Ticks: halbe Ziel-Dauer
    pub fn tick(&self) -> Duration {
        Duration::from_millis((self.ziel_ms / 2).max(1))
    }
}

// ---------------------------------------------------------------------------
// Flush-Einheit
// ---------------------------------------------------------------------------

/// Warum eine Einheit freigegeben wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushGrund {
    /// Geschaetzte Dauer hat das Ziel erreicht
    Ziel,
    /// Der aelteste Chunk hat die maximale Wartezeit erreicht
    MaxWarten,
}

impl FlushGrund {
    pub fn als_str(self) -> &'static str {
        match self {
            FlushGrund::Ziel => "ziel",
            FlushGrund::MaxWarten => "max_warten",
        }
    }
}

/// Zusammenhaengende Chunks fuer eine Wiedergabe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushEinheit {
    pub chunks: Vec<Vec<u8>>,
    pub grund: FlushGrund,
}

// ---------------------------------------------------------------------------
// Statistiken
// ---------------------------------------------------------------------------

/// Statistiken des Speaker Buffers (Snapshot)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeakerBufferStatistik {
    /// Anzahl empfangener Chunks gesamt
    pub empfangen: u64,
    /// Wegen Ueberlauf verworfene Chunks
    pub verworfen: u64,
    /// Abgegebene Flush-Einheiten
    pub flushes: u64,
    /// Faellige Flushes, die wegen laufender Wiedergabe warten mussten
    pub uebersprungen: u64,
    /// Aktueller Fuellstand in Chunks
    pub fuellstand: usize,
}

// ---------------------------------------------------------------------------
// SpeakerBuffer
// ---------------------------------------------------------------------------

pub struct SpeakerBuffer {
    config: SpeakerBufferConfig,
    /// Chunks mit Ankunftszeit, aeltester vorne
    queue: VecDeque<(Instant, Vec<u8>)>,
    /// Ein faelliger Flush musste warten; der naechste nimmt alles
    nachholen: bool,
    statistik: SpeakerBufferStatistik,
}

impl SpeakerBuffer {
    pub fn neu(config: SpeakerBufferConfig) -> Self {
        Self {
            queue: VecDeque::with_capacity(config.kapazitaet.min(256)),
            nachholen: false,
            config,
            statistik: SpeakerBufferStatistik::default(),
        }
    }

    pub fn standard() -> Self {
        Self::neu(SpeakerBufferConfig::default())
    }

    /// Haengt einen Chunk an
    ///
    /// Bei vollem Puffer wird der aelteste Chunk verworfen; liefert dann `true`.
    /// Blockiert nie.
    pub fn push(&mut self, chunk: Vec<u8>, jetzt: Instant) -> bool {
        self.statistik.empfangen += 1;
        let mut verworfen = false;
        if self.queue.len() >= self.config.kapazitaet.max(1) {
            self.queue.pop_front();
            self.statistik.verworfen += 1;
            verworfen = true;
            tracing::warn!(
                kapazitaet = self.config.kapazitaet,
                "Speaker-Buffer-Ueberlauf: aeltester Chunk verworfen"
            );
        }
        self.queue.push_back((jetzt, chunk));
        self.statistik.fuellstand = self.queue.len();
        verworfen
    }

    /// Geschaetzte Audiodauer: Chunk-Anzahl mal nominelle Chunk-Dauer
    pub fn geschaetzte_dauer(&self) -> Duration {
        Duration::from_millis(self.queue.len() as u64 * self.config.chunk_ms)
    }

    /// Max-Warten-Frist; gesetzt, solange der Puffer nicht leer ist
    pub fn frist(&self) -> Option<Instant> {
        self.queue
            .front()
            .map(|(ankunft, _)| *ankunft + Duration::from_millis(self.config.max_warten_ms))
    }

    /// Prueft, ob ein Flush faellig ist
    pub fn faellig(&self, jetzt: Instant) -> Option<FlushGrund> {
        if self.queue.is_empty() {
            return None;
        }
        match self.frist() {
            Some(frist) if jetzt >= frist => Some(FlushGrund::MaxWarten),
            _ if self.geschaetzte_dauer() >= Duration::from_millis(self.config.ziel_ms) => {
                Some(FlushGrund::Ziel)
            }
            _ => None,
        }
    }

    /// Gibt eine faellige Einheit frei
    ///
    /// Laeuft beim Teilnehmer noch eine Wiedergabe (`wiedergabe_aktiv`),
    /// bleibt alles gepuffert und der Flush wird als uebersprungen gezaehlt.
    /// Der naechste Flush gibt dann die ganze Queue frei.
    pub fn flush(&mut self, jetzt: Instant, wiedergabe_aktiv: bool) -> Option<FlushEinheit> {
        let grund = self.faellig(jetzt)?;
        if wiedergabe_aktiv {
            self.nachholen = true;
            self.statistik.uebersprungen += 1;
            tracing::trace!(
                fuellstand = self.queue.len(),
                "Flush uebersprungen, Wiedergabe laeuft noch"
            );
            return None;
        }

        let anzahl = match grund {
            FlushGrund::Ziel if !self.nachholen => {
                self.config.chunks_pro_einheit().min(self.queue.len())
            }
            _ => self.queue.len(),
        };
        self.nachholen = false;
        let chunks = self.queue.drain(..anzahl).map(|(_, c)| c).collect();
        self.statistik.flushes += 1;
        self.statistik.fuellstand = self.queue.len();
        Some(FlushEinheit { chunks, grund })
    }

    /// Verwirft alle gepufferten Chunks
    pub fn leeren(&mut self) {
        self.queue.clear();
        self.nachholen = false;
        self.statistik.fuellstand = 0;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn statistik(&self) -> &SpeakerBufferStatistik {
        &self.statistik
    }

    pub fn config(&self) -> &SpeakerBufferConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(i: u8) -> Vec<u8> {
        vec![i; 4]
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn standardwerte() {
        let c = SpeakerBufferConfig::default();
        assert_eq!(c.ziel_ms, 150);
        assert_eq!(c.max_warten_ms, 500);
        assert_eq!(c.kapazitaet, 100);
        assert_eq!(c.chunks_pro_einheit(), 15);
        assert_eq!(c.tick(), ms(75));
    }

    #[test]
    fn einheit_aufgerundet() {
        let c = SpeakerBufferConfig {
            ziel_ms: 155,
            ..SpeakerBufferConfig::default()
        };
        assert_eq!(c.chunks_pro_einheit(), 16);
    }

    #[test]
    fn leerer_puffer_ohne_frist() {
        let buf = SpeakerBuffer::standard();
        assert_eq!(buf.frist(), None);
        assert_eq!(buf.faellig(Instant::now()), None);
    }

    #[test]
    fn frist_haengt_am_aeltesten_chunk() {
        let t0 = Instant::now();
        let mut buf = SpeakerBuffer::standard();
        buf.push(chunk(0), t0);
        buf.push(chunk(1), t0 + ms(40));
        assert_eq!(buf.frist(), Some(t0 + ms(500)));
    }

    #[test]
    fn burst_ergibt_zwei_einheiten() {
        let t0 = Instant::now();
        let mut buf = SpeakerBuffer::standard();
        for i in 0..20 {
            buf.push(chunk(i), t0);
        }

        let erste = buf.flush(t0 + ms(75), false).unwrap();
        assert_eq!(erste.grund, FlushGrund::Ziel);
        assert_eq!(erste.chunks.len(), 15);
        assert_eq!(erste.chunks[0], chunk(0));

        // Rest wartet auf die Frist
        assert!(buf.flush(t0 + ms(450), false).is_none());
        let zweite = buf.flush(t0 + ms(525), false).unwrap();
        assert_eq!(zweite.grund, FlushGrund::MaxWarten);
        assert_eq!(zweite.chunks.len(), 5);
        assert_eq!(zweite.chunks[0], chunk(15));

        assert!(buf.is_empty());
        assert_eq!(buf.statistik().flushes, 2);
    }

    #[test]
    fn einzelner_chunk_nach_max_warten() {
        let t0 = Instant::now();
        let mut buf = SpeakerBuffer::standard();
        buf.push(chunk(7), t0);
        assert!(buf.flush(t0 + ms(499), false).is_none());
        let einheit = buf.flush(t0 + ms(500), false).unwrap();
        assert_eq!(einheit.grund, FlushGrund::MaxWarten);
        assert_eq!(einheit.chunks, vec![chunk(7)]);
        assert_eq!(buf.frist(), None);
    }

    #[test]
    fn laufende_wiedergabe_haelt_zurueck() {
        let t0 = Instant::now();
        let mut buf = SpeakerBuffer::standard();
        for i in 0..15 {
            buf.push(chunk(i), t0);
        }
        assert!(buf.flush(t0, true).is_none());
        assert_eq!(buf.len(), 15);
        assert_eq!(buf.statistik().uebersprungen, 1);

        assert_eq!(buf.flush(t0, false).unwrap().chunks.len(), 15);
    }

    #[test]
    fn nach_uebersprungenem_flush_geht_alles_raus() {
        let t0 = Instant::now();
        let mut buf = SpeakerBuffer::standard();
        for i in 0..40 {
            buf.push(chunk(i), t0 + ms(i as u64 * 10));
        }
        assert!(buf.flush(t0 + ms(400), true).is_none());

        let einheit = buf.flush(t0 + ms(475), false).unwrap();
        assert_eq!(einheit.grund, FlushGrund::Ziel);
        assert_eq!(einheit.chunks.len(), 40);
        assert!(buf.is_empty());

        // Der naechste Schub beginnt wieder mit einer Ziel-Einheit
        for i in 0..20 {
            buf.push(chunk(i), t0 + ms(500));
        }
        assert_eq!(buf.flush(t0 + ms(550), false).unwrap().chunks.len(), 15);
    }

    #[test]
    fn abgelaufene_frist_hat_vorrang() {
        let t0 = Instant::now();
        let mut buf = SpeakerBuffer::standard();
        buf.push(chunk(0), t0);
        for i in 1..30 {
            buf.push(chunk(i), t0 + ms(300));
        }
        assert_eq!(buf.faellig(t0 + ms(499)), Some(FlushGrund::Ziel));
        assert_eq!(buf.faellig(t0 + ms(500)), Some(FlushGrund::MaxWarten));

        let einheit = buf.flush(t0 + ms(500), false).unwrap();
        assert_eq!(einheit.grund, FlushGrund::MaxWarten);
        assert_eq!(einheit.chunks.len(), 30);
    }

    #[test]
    fn ueberlauf_verwirft_aeltesten() {
        let t0 = Instant::now();
        let mut buf = SpeakerBuffer::neu(SpeakerBufferConfig {
            kapazitaet: 3,
            ..SpeakerBufferConfig::default()
        });
        assert!(!buf.push(chunk(0), t0));
        assert!(!buf.push(chunk(1), t0 + ms(10)));
        assert!(!buf.push(chunk(2), t0 + ms(20)));
        assert!(buf.push(chunk(3), t0 + ms(30)));

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.statistik().verworfen, 1);
        // Frist richtet sich jetzt nach Chunk 1
        assert_eq!(buf.frist(), Some(t0 + ms(510)));

        let einheit = buf.flush(t0 + ms(600), false).unwrap();
        assert_eq!(einheit.chunks, vec![chunk(1), chunk(2), chunk(3)]);
    }

    #[test]
    fn reihenfolge_bleibt_erhalten() {
        let t0 = Instant::now();
        let mut buf = SpeakerBuffer::standard();
        for i in (0..30).rev() {
            buf.push(chunk(i), t0);
        }
        let einheit = buf.flush(t0, false).unwrap();
        let erwartet: Vec<Vec<u8>> = (15..30).rev().map(chunk).collect();
        assert_eq!(einheit.chunks, erwartet);
    }

    #[test]
    fn leeren_setzt_zurueck() {
        let t0 = Instant::now();
        let mut buf = SpeakerBuffer::standard();
        buf.push(chunk(0), t0);
        buf.leeren();
        assert!(buf.is_empty());
        assert_eq!(buf.statistik().fuellstand, 0);
        assert_eq!(buf.frist(), None);
    }
}
