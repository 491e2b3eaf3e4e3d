//! Audio-Geraete: Enumeration, Auswahl und Hot-Plug
//!
//! Die eigentliche Hardware steckt hinter dem [`DeviceBackend`]-Trait
//! (Produktion: [`CpalBackend`]). Die [`DeviceRegistry`] haelt die zuletzt
//! gesehenen Listen und die aktuelle Auswahl und benachrichtigt Abonnenten
//! bei jeder Hardware-Aenderung genau einmal.
//!
//! cpal kennt keine Hot-Plug-Benachrichtigung. Aenderungen kommen deshalb
//! entweder vom Host ([`DeviceRegistry::hardware_geaendert`]) oder von einem
//! Polling-Waechter ([`DeviceRegistry::beobachten`]), der aufeinanderfolgende
//! Enumerationen vergleicht.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capture::{open_cpal_microphone, CaptureConfig, MicrophoneStream};
use crate::error::{AudioError, AudioResult};

// ---------------------------------------------------------------------------
// Typen
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Input,
    Output,
}

/// Beschreibung eines Audio-Geraets
///
/// Ein leeres `label` ist gueltig (Browser und manche Treiber liefern
/// Namen erst nach Freigabe).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl DeviceDescriptor {
    pub fn eingang(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: DeviceKind::Input,
        }
    }

    pub fn ausgang(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: DeviceKind::Output,
        }
    }
}

/// Zugriff auf die Audio-Hardware
pub trait DeviceBackend: Send + Sync + 'static {
    /// Listet alle Eingabegeraete
    fn eingaenge(&self) -> AudioResult<Vec<DeviceDescriptor>>;

    /// Listet alle Ausgabegeraete
    fn ausgaenge(&self) -> AudioResult<Vec<DeviceDescriptor>>;

    /// Oeffnet ein Mikrofon (`None` = Standardgeraet)
    ///
    /// Das Geraet bleibt belegt, bis der zurueckgegebene Stream gedroppt wird.
    fn mikrofon_oeffnen(
        &self,
        geraet: Option<&str>,
        config: &CaptureConfig,
    ) -> AudioResult<Box<dyn MicrophoneStream>>;
}

// ---------------------------------------------------------------------------
// cpal-Backend
// ---------------------------------------------------------------------------

/// Produktions-Backend ueber den cpal-Standardhost
///
/// Als ID dient der Geraetename, da cpal keine stabilen IDs liefert.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    fn beschreiben(device: &Device, kind: DeviceKind) -> Option<DeviceDescriptor> {
        match device.name() {
            Ok(name) => Some(DeviceDescriptor {
                id: name.clone(),
                label: name,
                kind,
            }),
            Err(e) => {
                warn!("Geraetename konnte nicht gelesen werden: {}", e);
                None
            }
        }
    }
}

impl DeviceBackend for CpalBackend {
    fn eingaenge(&self) -> AudioResult<Vec<DeviceDescriptor>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?;
        let liste: Vec<_> = devices
            .filter_map(|d| Self::beschreiben(&d, DeviceKind::Input))
            .collect();
        debug!("Gefundene Eingabegeraete: {}", liste.len());
        Ok(liste)
    }

    fn ausgaenge(&self) -> AudioResult<Vec<DeviceDescriptor>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?;
        let liste: Vec<_> = devices
            .filter_map(|d| Self::beschreiben(&d, DeviceKind::Output))
            .collect();
        debug!("Gefundene Ausgabegeraete: {}", liste.len());
        Ok(liste)
    }

    fn mikrofon_oeffnen(
        &self,
        geraet: Option<&str>,
        config: &CaptureConfig,
    ) -> AudioResult<Box<dyn MicrophoneStream>> {
        let stream = open_cpal_microphone(geraet.map(str::to_string), config.clone())?;
        Ok(Box::new(stream))
    }
}

/// Laedt ein cpal-Eingabegeraet anhand seines Namens
pub fn load_cpal_input_device(name: Option<&str>) -> AudioResult<Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or(AudioError::KeinStandardEingabegeraet),
        Some(n) => host
            .input_devices()
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?
            .find(|d| d.name().map(|dn| dn == n).unwrap_or(false))
            .ok_or_else(|| AudioError::GeraetNichtGefunden(n.to_string())),
    }
}

/// Laedt ein cpal-Ausgabegeraet anhand seines Namens
pub fn load_cpal_output_device(name: Option<&str>) -> AudioResult<Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or(AudioError::KeinStandardAusgabegeraet),
        Some(n) => host
            .output_devices()
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?
            .find(|d| d.name().map(|dn| dn == n).unwrap_or(false))
            .ok_or_else(|| AudioError::GeraetNichtGefunden(n.to_string())),
    }
}

// ---------------------------------------------------------------------------
// DeviceRegistry
// ---------------------------------------------------------------------------

/// Ergebnis einer Hardware-Aenderung, wie es Abonnenten sehen
#[derive(Debug, Clone)]
pub struct GeraeteAenderung {
    pub eingaenge: Vec<DeviceDescriptor>,
    pub ausgaenge: Vec<DeviceDescriptor>,
    /// Das aktuell verwendete Eingabegeraet ist betroffen (verschwunden,
    /// oder Standardgeraet bei geaenderter Eingangsliste)
    pub eingang_betroffen: bool,
    /// Die Ausgabe muss neu geoeffnet werden (Auswahl gewechselt,
    /// verschwunden, oder Standardgeraet bei geaenderter Ausgangsliste)
    pub ausgang_betroffen: bool,
}

pub type AenderungsCallback = Arc<dyn Fn(&GeraeteAenderung) + Send + Sync>;

/// Kennung einer Callback-Registrierung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Debug, Default)]
struct RegistryZustand {
    eingaenge: Vec<DeviceDescriptor>,
    ausgaenge: Vec<DeviceDescriptor>,
    aktueller_eingang: Option<String>,
    aktueller_ausgang: Option<String>,
}

struct RegistryInner {
    backend: Arc<dyn DeviceBackend>,
    probe_config: CaptureConfig,
    zustand: RwLock<RegistryZustand>,
    callbacks: Mutex<Vec<(CallbackId, AenderungsCallback)>>,
    naechste_id: AtomicU64,
}

/// Verwaltet Geraetelisten und die aktuelle Ein-/Ausgabeauswahl
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    /// Erstellt die Registry und fuehrt die erste Enumeration durch
    ///
    /// Schlaegt die Enumeration fehl, startet die Registry mit leeren Listen.
    pub fn neu(backend: Arc<dyn DeviceBackend>, probe_config: CaptureConfig) -> Self {
        let registry = Self {
            inner: Arc::new(RegistryInner {
                backend,
                probe_config,
                zustand: RwLock::new(RegistryZustand::default()),
                callbacks: Mutex::new(Vec::new()),
                naechste_id: AtomicU64::new(1),
            }),
        };
        let (eingaenge, ausgaenge) = registry.enumerieren();
        {
            let mut z = registry.inner.zustand.write();
            z.eingaenge = eingaenge;
            z.ausgaenge = ausgaenge;
        }
        registry
    }

    pub fn backend(&self) -> Arc<dyn DeviceBackend> {
        Arc::clone(&self.inner.backend)
    }

    pub fn list_inputs(&self) -> Vec<DeviceDescriptor> {
        self.inner.zustand.read().eingaenge.clone()
    }

    pub fn list_outputs(&self) -> Vec<DeviceDescriptor> {
        self.inner.zustand.read().ausgaenge.clone()
    }

    /// Aktuelles Eingabegeraet (`None` = Standardgeraet)
    pub fn aktueller_eingang(&self) -> Option<String> {
        self.inner.zustand.read().aktueller_eingang.clone()
    }

    pub fn aktueller_ausgang(&self) -> Option<String> {
        self.inner.zustand.read().aktueller_ausgang.clone()
    }

    /// Waehlt ein Eingabegeraet nach einer kurzen Probe-Aufnahme
    ///
    /// Schlaegt die Probe fehl, bleibt die bisherige Auswahl unveraendert.
    pub fn select_input(&self, id: &str) -> AudioResult<()> {
        let probe = self
            .inner
            .backend
            .mikrofon_oeffnen(Some(id), &self.inner.probe_config)
            .map_err(|e| {
                warn!(geraet = id, fehler = %e, "Probe des Eingabegeraets fehlgeschlagen");
                e
            })?;
        drop(probe);

        self.inner.zustand.write().aktueller_eingang = Some(id.to_string());
        info!(geraet = id, "Eingabegeraet gewaehlt");
        Ok(())
    }

    /// Waehlt ein Ausgabegeraet; Abonnenten sehen `ausgang_betroffen`
    pub fn select_output(&self, id: &str) -> AudioResult<()> {
        let aenderung = {
            let mut z = self.inner.zustand.write();
            if !z.ausgaenge.iter().any(|d| d.id == id) {
                return Err(AudioError::GeraetNichtGefunden(id.to_string()));
            }
            if z.aktueller_ausgang.as_deref() == Some(id) {
                return Ok(());
            }
            z.aktueller_ausgang = Some(id.to_string());
            GeraeteAenderung {
                eingaenge: z.eingaenge.clone(),
                ausgaenge: z.ausgaenge.clone(),
                eingang_betroffen: false,
                ausgang_betroffen: true,
            }
        };
        info!(geraet = id, "Ausgabegeraet gewaehlt");
        self.melden(&aenderung);
        Ok(())
    }

    /// Registriert einen Callback fuer Hardware-Aenderungen
    pub fn on_change<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&GeraeteAenderung) + Send + Sync + 'static,
    {
        let id = CallbackId(self.inner.naechste_id.fetch_add(1, Ordering::Relaxed));
        self.inner.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn callback_entfernen(&self, id: CallbackId) {
        self.inner.callbacks.lock().retain(|(cid, _)| *cid != id);
    }

    /// Meldet eine Hardware-Aenderung vom Host
    ///
    /// Enumeriert neu und ruft jeden Callback genau einmal auf.
    pub fn hardware_geaendert(&self) {
        let (eingaenge, ausgaenge) = self.enumerieren();
        self.aenderung_anwenden(eingaenge, ausgaenge);
    }

    /// Startet einen Polling-Waechter fuer Hot-Plug
    pub fn beobachten(&self, intervall: Duration) -> AudioResult<GeraeteWaechter> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let registry = self.clone();

        let thread = std::thread::Builder::new()
            .name("huddle-geraete-waechter".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(intervall) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                let (eingaenge, ausgaenge) = registry.enumerieren();
                let unveraendert = {
                    let z = registry.inner.zustand.read();
                    z.eingaenge == eingaenge && z.ausgaenge == ausgaenge
                };
                if !unveraendert {
                    debug!("Geraete-Waechter: Aenderung erkannt");
                    registry.aenderung_anwenden(eingaenge, ausgaenge);
                }
            })
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?;

        Ok(GeraeteWaechter {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn enumerieren(&self) -> (Vec<DeviceDescriptor>, Vec<DeviceDescriptor>) {
        let eingaenge = self.inner.backend.eingaenge().unwrap_or_else(|e| {
            warn!("Enumeration der Eingabegeraete fehlgeschlagen: {}", e);
            Vec::new()
        });
        let ausgaenge = self.inner.backend.ausgaenge().unwrap_or_else(|e| {
            warn!("Enumeration der Ausgabegeraete fehlgeschlagen: {}", e);
            Vec::new()
        });
        (eingaenge, ausgaenge)
    }

    fn aenderung_anwenden(&self, eingaenge: Vec<DeviceDescriptor>, ausgaenge: Vec<DeviceDescriptor>) {
        let aenderung = {
            let mut z = self.inner.zustand.write();
            let eingaenge_geaendert = z.eingaenge != eingaenge;

            let eingang_betroffen = match &z.aktueller_eingang {
                None => eingaenge_geaendert,
                Some(id) => !eingaenge.iter().any(|d| &d.id == id),
            };
            if eingang_betroffen {
                if let Some(id) = z.aktueller_eingang.take() {
                    warn!(geraet = %id, "Gewaehltes Eingabegeraet verschwunden, nutze Standard");
                }
            }
            let ausgang_betroffen = match &z.aktueller_ausgang {
                None => z.ausgaenge != ausgaenge,
                Some(id) => !ausgaenge.iter().any(|d| &d.id == id),
            };
            if ausgang_betroffen {
                if let Some(id) = z.aktueller_ausgang.take() {
                    warn!(geraet = %id, "Gewaehltes Ausgabegeraet verschwunden, nutze Standard");
                }
            }

            z.eingaenge = eingaenge.clone();
            z.ausgaenge = ausgaenge.clone();
            GeraeteAenderung {
                eingaenge,
                ausgaenge,
                eingang_betroffen,
                ausgang_betroffen,
            }
        };

        info!(
            eingaenge = aenderung.eingaenge.len(),
            ausgaenge = aenderung.ausgaenge.len(),
            eingang_betroffen = aenderung.eingang_betroffen,
            ausgang_betroffen = aenderung.ausgang_betroffen,
            "Audio-Hardware geaendert"
        );
        self.melden(&aenderung);
    }

    /// Ruft alle Callbacks ausserhalb der Locks auf
    fn melden(&self, aenderung: &GeraeteAenderung) {
        let callbacks: Vec<AenderungsCallback> = self
            .inner
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(aenderung);
        }
    }
}

/// Laufender Polling-Waechter; stoppt beim Drop
pub struct GeraeteWaechter {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for GeraeteWaechter {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
