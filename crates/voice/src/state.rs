//! Peer-Zustand – Audio-Zustand aller Teilnehmer einer Sitzung
//!
//! Verwaltet pro entferntem Teilnehmer:
//! - Speaker-Buffer mit den eingegangenen Chunks
//! - Wiedergabe-Pipeline (Decoder + Effektkette)
//! - Marker der laufenden Dekodierung bzw. Wiedergabe
//! - Sprecher-Zustand
//!
//! Thread-safe durch DashMap. Jeder Eintrag traegt eine Epoche, damit
//! Wiedergabe-Tasks eines bereits entfernten Teilnehmers keinen neu
//! angelegten Eintrag gleicher ID veraendern.

use dashmap::DashMap;
use huddle_audio::{CodecFactory, EffektConfig};
use huddle_core::types::UserId;
use huddle_core::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::detector::{DetectorConfig, SpeakingDetector};
use crate::playback::PeerPipeline;
use crate::speaker_buffer::{FlushEinheit, SpeakerBuffer, SpeakerBufferConfig};

// ---------------------------------------------------------------------------
// PeerAudioState
// ---------------------------------------------------------------------------

/// Eine beim Sink eingeplante Wiedergabe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wiedergabe {
    /// Sink-ID
    pub id: u64,
    /// Geplantes Ende laut Sample-Anzahl
    pub ende: Instant,
}

pub struct PeerAudioState {
    pub user_id: UserId,
    pub buffer: SpeakerBuffer,
    /// Eine Einheit steckt in der Dekodierung
    dekodiert: bool,
    /// Eingeplante Wiedergaben; hoechstens eine laeuft, eine weitere schliesst an
    wiedergaben: Vec<Wiedergabe>,
    /// `None`, solange die Pipeline in einer Dekodierung steckt
    pipeline: Option<PeerPipeline>,
    pub detector: SpeakingDetector,
    pub zuletzt_gesehen: Instant,
    epoche: u64,
}

/// Momentaufnahme eines Teilnehmers fuer die Oberflaeche
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub user_id: UserId,
    pub spricht: bool,
    pub gepuffert: usize,
    pub spielt: bool,
    /// Ankunft des letzten Chunks bzw. Anlage des Teilnehmers
    pub zuletzt_gesehen: Instant,
}

/// Ergebnis einer Flush-Pruefung
pub enum FlushSchritt {
    /// Nichts faellig
    Nichts,
    /// Faellig, aber es laeuft noch eine Wiedergabe
    Uebersprungen,
    /// Einheit freigegeben; der Aufrufer dekodiert und spielt ab
    Einheit {
        einheit: FlushEinheit,
        pipeline: PeerPipeline,
        epoche: u64,
        /// Ende der noch laufenden Wiedergabe; die Einheit beginnt fruehestens dort
        anschluss: Option<Instant>,
    },
}

// ---------------------------------------------------------------------------
// PeerArena
// ---------------------------------------------------------------------------

/// Parameter fuer neu angelegte Teilnehmer
pub struct PeerVorlage {
    pub puffer: SpeakerBufferConfig,
    pub sprecher: DetectorConfig,
    pub effekte: EffektConfig,
    pub sample_rate: u32,
    pub codec: Arc<dyn CodecFactory>,
    pub clock: Arc<dyn Clock>,
}

/// Alle Teilnehmer einer Sitzung, indexiert nach UserId
#[derive(Clone)]
pub struct PeerArena {
    inner: Arc<PeerArenaInner>,
}

struct PeerArenaInner {
    peers: DashMap<UserId, PeerAudioState>,
    vorlage: PeerVorlage,
    naechste_epoche: AtomicU64,
}

impl PeerArena {
    pub fn neu(vorlage: PeerVorlage) -> Self {
        Self {
            inner: Arc::new(PeerArenaInner {
                peers: DashMap::new(),
                vorlage,
                naechste_epoche: AtomicU64::new(1),
            }),
        }
    }

    fn peer_anlegen(&self, user_id: UserId, jetzt: Instant) -> PeerAudioState {
        let v = &self.inner.vorlage;
        PeerAudioState {
            user_id,
            buffer: SpeakerBuffer::neu(v.puffer.clone()),
            dekodiert: false,
            wiedergaben: Vec::new(),
            pipeline: None,
            detector: SpeakingDetector::neu(v.sprecher.clone(), Arc::clone(&v.clock)),
            zuletzt_gesehen: jetzt,
            epoche: self.inner.naechste_epoche.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Legt den Teilnehmer an, falls er fehlt; liefert `true` bei Neuanlage
    pub fn sicherstellen(&self, user_id: UserId, jetzt: Instant) -> bool {
        let mut neu = false;
        self.inner.peers.entry(user_id).or_insert_with(|| {
            neu = true;
            self.peer_anlegen(user_id, jetzt)
        });
        if neu {
            tracing::debug!(peer = %user_id, "Teilnehmer angelegt");
        }
        neu
    }

    /// Legt einen Chunk im Puffer ab
    ///
    /// Liefert `(neu_angelegt, aeltester_verworfen)`.
    pub fn chunk_ablegen(&self, user_id: UserId, chunk: Vec<u8>, jetzt: Instant) -> (bool, bool) {
        let neu = self.sicherstellen(user_id, jetzt);
        let verworfen = self
            .inner
            .peers
            .get_mut(&user_id)
            .map(|mut p| {
                p.zuletzt_gesehen = jetzt;
                p.buffer.push(chunk, jetzt)
            })
            .unwrap_or(false);
        (neu, verworfen)
    }

    /// Prueft einen Teilnehmer auf einen faelligen Flush
    ///
    /// Der Teilnehmer gilt als beschaeftigt, solange dekodiert wird oder die
    /// laufende Wiedergabe erst nach dem naechsten Tick endet. Endet sie
    /// vorher, wird die naechste Einheit direkt dahinter eingeplant.
    /// Bei einer freigegebenen Einheit ist der Teilnehmer danach als
    /// dekodierend markiert und die Pipeline an den Aufrufer uebergeben.
    pub fn flush_pruefen(&self, user_id: UserId, jetzt: Instant) -> FlushSchritt {
        let Some(mut peer) = self.inner.peers.get_mut(&user_id) else {
            return FlushSchritt::Nichts;
        };
        peer.wiedergaben.retain(|w| w.ende > jetzt);
        let anschluss = peer.wiedergaben.iter().map(|w| w.ende).max();
        let tick = self.inner.vorlage.puffer.tick();
        let beschaeftigt = peer.dekodiert || anschluss.is_some_and(|ende| ende > jetzt + tick);

        let faellig = peer.buffer.faellig(jetzt).is_some();
        let Some(einheit) = peer.buffer.flush(jetzt, beschaeftigt) else {
            return if faellig {
                FlushSchritt::Uebersprungen
            } else {
                FlushSchritt::Nichts
            };
        };

        let pipeline = match peer.pipeline.take() {
            Some(p) => p,
            None => {
                let v = &self.inner.vorlage;
                match PeerPipeline::neu(v.codec.as_ref(), &v.effekte, v.sample_rate) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(
                            peer = %user_id,
                            fehler = %e,
                            "Decoder nicht verfuegbar, Einheit verworfen"
                        );
                        return FlushSchritt::Nichts;
                    }
                }
            }
        };
        peer.dekodiert = true;
        FlushSchritt::Einheit {
            einheit,
            pipeline,
            epoche: peer.epoche,
            anschluss,
        }
    }

    /// Traegt die eingeplante Wiedergabe ein und gibt die Pipeline zurueck
    ///
    /// `false`, wenn der Teilnehmer inzwischen entfernt wurde.
    pub fn wiedergabe_gestartet(
        &self,
        user_id: UserId,
        epoche: u64,
        wiedergabe: Wiedergabe,
        pipeline: PeerPipeline,
    ) -> bool {
        match self.inner.peers.get_mut(&user_id) {
            Some(mut peer) if peer.epoche == epoche => {
                peer.dekodiert = false;
                peer.wiedergaben.push(wiedergabe);
                peer.pipeline = Some(pipeline);
                true
            }
            _ => false,
        }
    }

    /// Traegt eine beendete oder gestoppte Wiedergabe aus
    pub fn wiedergabe_beendet(&self, user_id: UserId, epoche: u64, id: u64) {
        if let Some(mut peer) = self.inner.peers.get_mut(&user_id) {
            if peer.epoche == epoche {
                peer.wiedergaben.retain(|w| w.id != id);
            }
        }
    }

    /// Dekodierung ohne Wiedergabe beendet (leer, fehlerhaft oder abgebrochen)
    pub fn dekodierung_beendet(
        &self,
        user_id: UserId,
        epoche: u64,
        pipeline: Option<PeerPipeline>,
    ) {
        if let Some(mut peer) = self.inner.peers.get_mut(&user_id) {
            if peer.epoche != epoche {
                return;
            }
            peer.dekodiert = false;
            if pipeline.is_some() {
                peer.pipeline = pipeline;
            }
        }
    }

    /// Uebernimmt einen gemeldeten Sprechzustand; liefert den Wechsel
    pub fn sprechen_setzen(&self, user_id: UserId, spricht: bool, jetzt: Instant) -> Option<bool> {
        self.sicherstellen(user_id, jetzt);
        self.inner
            .peers
            .get_mut(&user_id)
            .and_then(|mut p| p.detector.setzen(spricht))
    }

    pub fn entfernen(&self, user_id: UserId) -> Option<PeerAudioState> {
        self.inner.peers.remove(&user_id).map(|(_, p)| p)
    }

    /// Entfernt alle Teilnehmer; liefert die Anzahl
    pub fn leeren(&self) -> usize {
        let anzahl = self.inner.peers.len();
        self.inner.peers.clear();
        anzahl
    }

    /// Momentaufnahme der IDs fuer den Flush-Takt
    pub fn ids(&self) -> Vec<UserId> {
        self.inner.peers.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.peers.is_empty()
    }

    pub fn sprechende(&self) -> usize {
        self.inner
            .peers
            .iter()
            .filter(|e| e.detector.spricht())
            .count()
    }

    pub fn info(&self, user_id: UserId) -> Option<PeerInfo> {
        self.inner.peers.get(&user_id).map(|p| PeerInfo::aus(&p))
    }

    pub fn alle(&self) -> Vec<PeerInfo> {
        self.inner.peers.iter().map(|e| PeerInfo::aus(e.value())).collect()
    }
}

impl PeerInfo {
    fn aus(p: &PeerAudioState) -> Self {
        Self {
            user_id: p.user_id,
            spricht: p.detector.spricht(),
            gepuffert: p.buffer.len(),
            spielt: p.dekodiert || !p.wiedergaben.is_empty(),
            zuletzt_gesehen: p.zuletzt_gesehen,
        }
    }
}

impl PeerAudioState {
    /// Sink-IDs der laufenden und der anschliessenden Wiedergabe
    pub fn laufende_wiedergaben(&self) -> impl Iterator<Item = u64> + '_ {
        self.wiedergaben.iter().map(|w| w.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_audio::{AudioDecoder, AudioEncoder, AudioError, AudioResult};
    use huddle_core::ManualClock;
    use std::time::Duration;

    struct NullCodec;
    struct NullDecoder;

    impl AudioDecoder for NullDecoder {
        fn decode(&mut self, _daten: &[u8]) -> AudioResult<Vec<f32>> {
            Ok(vec![0.0; 480])
        }
    }

    impl CodecFactory for NullCodec {
        fn encoder(&self) -> AudioResult<Box<dyn AudioEncoder>> {
            Err(AudioError::Konfiguration("nicht benoetigt".into()))
        }
        fn decoder(&self) -> AudioResult<Box<dyn AudioDecoder>> {
            Ok(Box::new(NullDecoder))
        }
    }

    fn arena() -> (PeerArena, ManualClock) {
        let clock = ManualClock::neu();
        let arena = PeerArena::neu(PeerVorlage {
            puffer: SpeakerBufferConfig::default(),
            sprecher: DetectorConfig::default(),
            effekte: EffektConfig::default(),
            sample_rate: 48_000,
            codec: Arc::new(NullCodec),
            clock: Arc::new(clock.clone()),
        });
        (arena, clock)
    }

    #[test]
    fn erster_chunk_legt_teilnehmer_an() {
        let (arena, clock) = arena();
        let peer = UserId::new();
        assert_eq!(arena.chunk_ablegen(peer, vec![1], clock.jetzt()), (true, false));
        assert_eq!(arena.chunk_ablegen(peer, vec![2], clock.jetzt()), (false, false));
        assert_eq!(arena.info(peer).unwrap().gepuffert, 2);
        assert!(!arena.sicherstellen(peer, clock.jetzt()));
    }

    #[test]
    fn nur_eine_einheit_gleichzeitig() {
        let (arena, clock) = arena();
        let peer = UserId::new();
        for i in 0..40u8 {
            arena.chunk_ablegen(peer, vec![i], clock.jetzt());
        }

        let FlushSchritt::Einheit {
            einheit,
            pipeline,
            epoche,
            anschluss,
        } = arena.flush_pruefen(peer, clock.jetzt())
        else {
            panic!("Einheit erwartet");
        };
        assert_eq!(einheit.chunks.len(), 15);
        assert_eq!(anschluss, None);

        // Waehrend der Dekodierung bleibt der Rest gepuffert
        assert!(matches!(
            arena.flush_pruefen(peer, clock.jetzt()),
            FlushSchritt::Uebersprungen
        ));
        let ende = clock.jetzt() + Duration::from_millis(170);
        assert!(arena.wiedergabe_gestartet(peer, epoche, Wiedergabe { id: 7, ende }, pipeline));
        assert!(arena.info(peer).unwrap().spielt);
        assert!(matches!(
            arena.flush_pruefen(peer, clock.jetzt()),
            FlushSchritt::Uebersprungen
        ));

        // Endet die Wiedergabe vor dem naechsten Tick, schliesst der Rest an
        clock.vorspulen(Duration::from_millis(100));
        match arena.flush_pruefen(peer, clock.jetzt()) {
            FlushSchritt::Einheit {
                einheit, anschluss, ..
            } => {
                assert_eq!(einheit.chunks.len(), 25);
                assert_eq!(anschluss, Some(ende));
            }
            _ => panic!("anschliessende Einheit erwartet"),
        }
    }

    #[test]
    fn beendete_wiedergabe_gibt_frei() {
        let (arena, clock) = arena();
        let peer = UserId::new();
        for i in 0..30u8 {
            arena.chunk_ablegen(peer, vec![i], clock.jetzt());
        }
        let FlushSchritt::Einheit {
            pipeline, epoche, ..
        } = arena.flush_pruefen(peer, clock.jetzt())
        else {
            panic!("Einheit erwartet");
        };
        let ende = clock.jetzt() + Duration::from_secs(1);
        assert!(arena.wiedergabe_gestartet(peer, epoche, Wiedergabe { id: 3, ende }, pipeline));
        assert_eq!(
            arena.entfernen(peer).unwrap().laufende_wiedergaben().collect::<Vec<_>>(),
            vec![3]
        );

        for i in 0..30u8 {
            arena.chunk_ablegen(peer, vec![i], clock.jetzt());
        }
        let FlushSchritt::Einheit {
            pipeline, epoche, ..
        } = arena.flush_pruefen(peer, clock.jetzt())
        else {
            panic!("Einheit erwartet");
        };
        assert!(arena.wiedergabe_gestartet(peer, epoche, Wiedergabe { id: 4, ende }, pipeline));
        // Gestoppt vor dem geplanten Ende
        arena.wiedergabe_beendet(peer, epoche, 4);
        assert!(!arena.info(peer).unwrap().spielt);
        assert!(matches!(
            arena.flush_pruefen(peer, clock.jetzt()),
            FlushSchritt::Einheit { anschluss: None, .. }
        ));
    }

    #[test]
    fn fehlgeschlagene_dekodierung_gibt_frei() {
        let (arena, clock) = arena();
        let peer = UserId::new();
        for i in 0..30u8 {
            arena.chunk_ablegen(peer, vec![i], clock.jetzt());
        }
        let FlushSchritt::Einheit { epoche, .. } = arena.flush_pruefen(peer, clock.jetzt()) else {
            panic!("Einheit erwartet");
        };
        arena.dekodierung_beendet(peer, epoche, None);
        assert!(!arena.info(peer).unwrap().spielt);
        // Ohne Pipeline wird eine neue angelegt
        assert!(matches!(
            arena.flush_pruefen(peer, clock.jetzt()),
            FlushSchritt::Einheit { .. }
        ));
    }

    #[test]
    fn zuletzt_gesehen_folgt_dem_letzten_chunk() {
        let (arena, clock) = arena();
        let peer = UserId::new();
        let anlage = clock.jetzt();
        arena.sicherstellen(peer, anlage);
        assert_eq!(arena.info(peer).unwrap().zuletzt_gesehen, anlage);

        clock.vorspulen(Duration::from_millis(250));
        arena.chunk_ablegen(peer, vec![1], clock.jetzt());
        assert_eq!(
            arena.info(peer).unwrap().zuletzt_gesehen,
            anlage + Duration::from_millis(250)
        );
        // Sprechmeldungen zaehlen nicht als Lebenszeichen
        clock.vorspulen(Duration::from_millis(100));
        arena.sprechen_setzen(peer, true, clock.jetzt());
        assert_eq!(
            arena.info(peer).unwrap().zuletzt_gesehen,
            anlage + Duration::from_millis(250)
        );
    }

    #[test]
    fn veraltete_epoche_wird_ignoriert() {
        let (arena, clock) = arena();
        let peer = UserId::new();
        for i in 0..15u8 {
            arena.chunk_ablegen(peer, vec![i], clock.jetzt());
        }
        let FlushSchritt::Einheit {
            pipeline, epoche, ..
        } = arena.flush_pruefen(peer, clock.jetzt())
        else {
            panic!("Einheit erwartet");
        };

        // Teilnehmer geht und kommt wieder
        assert!(arena.entfernen(peer).is_some());
        arena.sicherstellen(peer, clock.jetzt());
        let ende = clock.jetzt() + Duration::from_millis(150);
        assert!(!arena.wiedergabe_gestartet(peer, epoche, Wiedergabe { id: 1, ende }, pipeline));
        assert!(!arena.info(peer).unwrap().spielt);
    }

    #[test]
    fn max_warten_ueber_arena() {
        let (arena, clock) = arena();
        let peer = UserId::new();
        arena.chunk_ablegen(peer, vec![1], clock.jetzt());
        assert!(matches!(
            arena.flush_pruefen(peer, clock.jetzt()),
            FlushSchritt::Nichts
        ));
        clock.vorspulen(Duration::from_millis(500));
        match arena.flush_pruefen(peer, clock.jetzt()) {
            FlushSchritt::Einheit { einheit, .. } => assert_eq!(einheit.chunks.len(), 1),
            _ => panic!("erzwungener Flush erwartet"),
        }
    }

    #[test]
    fn sprechzustand_und_leeren() {
        let (arena, clock) = arena();
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(arena.sprechen_setzen(a, true, clock.jetzt()), Some(true));
        assert_eq!(arena.sprechen_setzen(a, true, clock.jetzt()), None);
        arena.sicherstellen(b, clock.jetzt());
        assert_eq!(arena.sprechende(), 1);
        assert_eq!(arena.ids().len(), 2);

        assert_eq!(arena.leeren(), 2);
        assert!(arena.is_empty());
    }
}
