//! Virtuelles Audio-Backend
//!
//! Reines In-Memory-Backend ohne Hardware: Geraetelisten sind frei setzbar,
//! Mikrofon-Samples werden per [`VirtuellesBackend::einspeisen`] eingespielt
//! und Fehler beim Oeffnen lassen sich gezielt ausloesen. Gedacht fuer Tests
//! und fuer Headless-Betrieb (z.B. Bots ohne Soundkarte).
//!
//! [`VirtuellerSink`] ist das Gegenstueck fuer die Ausgabe: Wiedergaben
//! laufen nur auf der Tokio-Uhr und werden protokolliert.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use huddle_core::types::UserId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::capture::{CaptureConfig, MicrophoneStream};
use crate::device::{DeviceBackend, DeviceDescriptor};
use crate::error::{AudioError, AudioResult};
use crate::mixer::{AudioSink, PlaybackHandle, Quelle};

/// ID des virtuellen Standard-Mikrofons
pub const STANDARD_MIKROFON: &str = "virtuell-mikrofon";
/// ID des virtuellen Standard-Lautsprechers
pub const STANDARD_LAUTSPRECHER: &str = "virtuell-lautsprecher";

/// Ausloesbare Fehler beim Oeffnen eines Mikrofons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtuellerFehler {
    ZugriffVerweigert,
    NichtGefunden,
    Belegt,
}

impl VirtuellerFehler {
    fn als_audio_error(self, geraet: &str) -> AudioError {
        match self {
            Self::ZugriffVerweigert => AudioError::ZugriffVerweigert(geraet.to_string()),
            Self::NichtGefunden => AudioError::GeraetNichtGefunden(geraet.to_string()),
            Self::Belegt => AudioError::GeraetBelegt(geraet.to_string()),
        }
    }
}

struct VirtuellerZustand {
    eingaenge: Vec<DeviceDescriptor>,
    ausgaenge: Vec<DeviceDescriptor>,
    enumeration_defekt: bool,
    /// Fehler pro Geraet; Schluessel `None` = Standardgeraet
    fehler: HashMap<Option<String>, VirtuellerFehler>,
    /// Sender aller offenen Mikrofone
    mikrofone: Vec<Sender<Vec<f32>>>,
}

/// In-Memory-Backend ohne Hardware
#[derive(Clone)]
pub struct VirtuellesBackend {
    zustand: Arc<Mutex<VirtuellerZustand>>,
    offen: Arc<AtomicUsize>,
    oeffnungen: Arc<AtomicUsize>,
}

impl VirtuellesBackend {
    /// Ein Mikrofon und ein Lautsprecher
    pub fn neu() -> Self {
        Self {
            zustand: Arc::new(Mutex::new(VirtuellerZustand {
                eingaenge: vec![DeviceDescriptor::eingang(
                    STANDARD_MIKROFON,
                    "Virtuelles Mikrofon",
                )],
                ausgaenge: vec![DeviceDescriptor::ausgang(
                    STANDARD_LAUTSPRECHER,
                    "Virtueller Lautsprecher",
                )],
                enumeration_defekt: false,
                fehler: HashMap::new(),
                mikrofone: Vec::new(),
            })),
            offen: Arc::new(AtomicUsize::new(0)),
            oeffnungen: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn eingaenge_setzen(&self, liste: Vec<DeviceDescriptor>) {
        self.zustand.lock().eingaenge = liste;
    }

    pub fn ausgaenge_setzen(&self, liste: Vec<DeviceDescriptor>) {
        self.zustand.lock().ausgaenge = liste;
    }

    pub fn enumeration_fehlschlagen(&self, defekt: bool) {
        self.zustand.lock().enumeration_defekt = defekt;
    }

    /// Laesst das Oeffnen von `geraet` (`None` = Standard) fehlschlagen
    pub fn fehler_setzen(&self, geraet: Option<&str>, fehler: VirtuellerFehler) {
        self.zustand
            .lock()
            .fehler
            .insert(geraet.map(str::to_string), fehler);
    }

    pub fn fehler_entfernen(&self, geraet: Option<&str>) {
        self.zustand.lock().fehler.remove(&geraet.map(str::to_string));
    }

    /// Spielt Samples in alle offenen Mikrofone ein
    pub fn einspeisen(&self, samples: &[f32]) {
        let mut z = self.zustand.lock();
        z.mikrofone.retain(|tx| tx.send(samples.to_vec()).is_ok());
    }

    /// Anzahl aktuell belegter Mikrofone
    pub fn offene_mikrofone(&self) -> usize {
        self.offen.load(Ordering::SeqCst)
    }

    /// Anzahl erfolgreicher Oeffnungen seit Erstellung
    pub fn oeffnungen(&self) -> usize {
        self.oeffnungen.load(Ordering::SeqCst)
    }
}

impl Default for VirtuellesBackend {
    fn default() -> Self {
        Self::neu()
    }
}

impl DeviceBackend for VirtuellesBackend {
    fn eingaenge(&self) -> AudioResult<Vec<DeviceDescriptor>> {
        let z = self.zustand.lock();
        if z.enumeration_defekt {
            return Err(AudioError::StreamFehler("Enumeration gestoert".into()));
        }
        Ok(z.eingaenge.clone())
    }

    fn ausgaenge(&self) -> AudioResult<Vec<DeviceDescriptor>> {
        let z = self.zustand.lock();
        if z.enumeration_defekt {
            return Err(AudioError::StreamFehler("Enumeration gestoert".into()));
        }
        Ok(z.ausgaenge.clone())
    }

    fn mikrofon_oeffnen(
        &self,
        geraet: Option<&str>,
        _config: &CaptureConfig,
    ) -> AudioResult<Box<dyn MicrophoneStream>> {
        let mut z = self.zustand.lock();
        let name = match geraet {
            Some(id) => id.to_string(),
            None => z
                .eingaenge
                .first()
                .map(|d| d.id.clone())
                .ok_or(AudioError::KeinStandardEingabegeraet)?,
        };
        if let Some(fehler) = z.fehler.get(&geraet.map(str::to_string)) {
            return Err(fehler.als_audio_error(&name));
        }
        if !z.eingaenge.iter().any(|d| d.id == name) {
            return Err(AudioError::GeraetNichtGefunden(name));
        }

        let (tx, rx) = unbounded();
        z.mikrofone.push(tx);
        self.offen.fetch_add(1, Ordering::SeqCst);
        self.oeffnungen.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtuellesMikrofon {
            geraet: name,
            rx,
            offen: Arc::clone(&self.offen),
        }))
    }
}

struct VirtuellesMikrofon {
    geraet: String,
    rx: Receiver<Vec<f32>>,
    offen: Arc<AtomicUsize>,
}

impl MicrophoneStream for VirtuellesMikrofon {
    fn lesen(&mut self, ziel: &mut Vec<f32>, warten: Duration) -> AudioResult<usize> {
        let mut gelesen = 0;
        match self.rx.recv_timeout(warten) {
            Ok(block) => {
                gelesen += block.len();
                ziel.extend_from_slice(&block);
            }
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(warten);
                return Ok(0);
            }
        }
        while let Ok(block) = self.rx.try_recv() {
            gelesen += block.len();
            ziel.extend_from_slice(&block);
        }
        Ok(gelesen)
    }

    fn geraet(&self) -> &str {
        &self.geraet
    }
}

impl Drop for VirtuellesMikrofon {
    fn drop(&mut self) {
        self.offen.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// VirtuellerSink
// ---------------------------------------------------------------------------

/// Protokolleintrag einer virtuellen Wiedergabe
#[derive(Debug, Clone)]
pub struct Wiedergabe {
    pub id: u64,
    pub quelle: Quelle,
    pub samples: Vec<f32>,
    /// Zeitpunkt des ersten hoerbaren Samples
    pub beginn: Instant,
    pub ende: Instant,
}

struct SinkZustand {
    laufend: HashMap<u64, JoinHandle<()>>,
    protokoll: Vec<Wiedergabe>,
    lautstaerke: f32,
    peer_lautstaerke: HashMap<UserId, f32>,
}

/// Ausgabe ohne Hardware
///
/// Jede Wiedergabe endet nach Verzoegerung plus Audiodauer. Muss innerhalb
/// einer Tokio-Runtime benutzt werden.
#[derive(Clone)]
pub struct VirtuellerSink {
    sample_rate: u32,
    naechste_id: Arc<AtomicU64>,
    zustand: Arc<Mutex<SinkZustand>>,
}

impl VirtuellerSink {
    pub fn neu(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            naechste_id: Arc::new(AtomicU64::new(1)),
            zustand: Arc::new(Mutex::new(SinkZustand {
                laufend: HashMap::new(),
                protokoll: Vec::new(),
                lautstaerke: 1.0,
                peer_lautstaerke: HashMap::new(),
            })),
        }
    }

    /// Alle bisher gestarteten Wiedergaben in Startreihenfolge
    pub fn protokoll(&self) -> Vec<Wiedergabe> {
        self.zustand.lock().protokoll.clone()
    }

    /// Anzahl noch laufender Wiedergaben
    pub fn laufende(&self) -> usize {
        self.zustand.lock().laufend.len()
    }

    pub fn peer_lautstaerke(&self, peer: UserId) -> Option<f32> {
        self.zustand.lock().peer_lautstaerke.get(&peer).copied()
    }
}

impl AudioSink for VirtuellerSink {
    fn abspielen(&self, quelle: Quelle, samples: Vec<f32>, verzoegerung: Duration) -> PlaybackHandle {
        let id = self.naechste_id.fetch_add(1, Ordering::SeqCst);
        let dauer = Duration::from_secs_f64(samples.len() as f64 / self.sample_rate as f64);
        let beginn = Instant::now() + verzoegerung;
        let ende = beginn + dauer;
        let (tx, rx) = oneshot::channel();

        let mut z = self.zustand.lock();
        z.protokoll.push(Wiedergabe {
            id,
            quelle,
            samples,
            beginn,
            ende,
        });
        let zustand = Arc::clone(&self.zustand);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(ende).await;
            zustand.lock().laufend.remove(&id);
            let _ = tx.send(());
        });
        z.laufend.insert(id, task);

        PlaybackHandle { id, fertig: rx }
    }

    fn stoppen(&self, id: u64) {
        if let Some(task) = self.zustand.lock().laufend.remove(&id) {
            task.abort();
        }
    }

    fn alle_stoppen(&self) {
        for (_, task) in self.zustand.lock().laufend.drain() {
            task.abort();
        }
    }

    fn set_lautstaerke(&self, lautstaerke: f32) {
        self.zustand.lock().lautstaerke = lautstaerke.clamp(0.0, 1.0);
    }

    fn lautstaerke(&self) -> f32 {
        self.zustand.lock().lautstaerke
    }

    fn set_peer_lautstaerke(&self, peer: UserId, lautstaerke: f32) {
        self.zustand
            .lock()
            .peer_lautstaerke
            .insert(peer, lautstaerke.clamp(0.0, 2.0));
    }
}
