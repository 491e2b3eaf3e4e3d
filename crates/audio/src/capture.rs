//! Mikrofon-Capture via cpal
//!
//! Der cpal-Stream ist `!Send` und lebt deshalb in einem eigenen Thread.
//! Der Callback mischt auf Mono herunter und schreibt in einen lock-free
//! Ring-Buffer; der Leser holt die Samples ueber [`MicrophoneStream::lesen`].
//! Wird der Stream gedroppt, beendet sich der Thread und gibt das Geraet frei.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, FromSample, SizedSample, Stream, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::device::load_cpal_input_device;
use crate::error::{AudioError, AudioResult};

/// Konfiguration fuer den Audio-Capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Abtastrate in Hz
    pub sample_rate: u32,
    /// Ring-Buffer Kapazitaet in Samples
    pub buffer_size: usize,
    /// Echo-Unterdrueckung anfordern
    pub echo_cancellation: bool,
    /// Rauschunterdrueckung anfordern
    pub noise_suppression: bool,
    /// Automatische Pegelanpassung anfordern
    pub auto_gain_control: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            buffer_size: 48_000 * 2, // 2 Sekunden Puffer
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Ein geoeffnetes Mikrofon (Mono, f32)
///
/// Solange der Stream existiert, ist das Geraet belegt.
pub trait MicrophoneStream: Send {
    /// Haengt alle verfuegbaren Samples an `ziel` an
    ///
    /// Liegt nichts vor, wird hoechstens `warten` lang blockiert.
    fn lesen(&mut self, ziel: &mut Vec<f32>, warten: Duration) -> AudioResult<usize>;

    /// Name bzw. ID des Geraets
    fn geraet(&self) -> &str;
}

pub type CaptureProducer = HeapProd<f32>;
pub type CaptureConsumer = HeapCons<f32>;

// ---------------------------------------------------------------------------
// cpal-Mikrofon
// ---------------------------------------------------------------------------

/// Mikrofon-Stream auf einem cpal-Geraet
pub struct CpalMikrofon {
    consumer: CaptureConsumer,
    geraet: String,
    stream_defekt: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneStream for CpalMikrofon {
    fn lesen(&mut self, ziel: &mut Vec<f32>, warten: Duration) -> AudioResult<usize> {
        if self.stream_defekt.load(Ordering::Relaxed) {
            return Err(AudioError::StreamFehler(format!(
                "Capture-Stream auf '{}' abgebrochen",
                self.geraet
            )));
        }
        if self.consumer.occupied_len() == 0 {
            std::thread::sleep(warten.min(Duration::from_millis(5)));
        }
        let verfuegbar = self.consumer.occupied_len();
        let start = ziel.len();
        ziel.resize(start + verfuegbar, 0.0);
        let gelesen = self.consumer.pop_slice(&mut ziel[start..]);
        ziel.truncate(start + gelesen);
        Ok(gelesen)
    }

    fn geraet(&self) -> &str {
        &self.geraet
    }
}

impl Drop for CpalMikrofon {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        debug!(geraet = %self.geraet, "Mikrofon freigegeben");
    }
}

/// Oeffnet ein Mikrofon (`None` = Standardgeraet)
///
/// Kehrt erst zurueck, wenn der Stream laeuft oder das Oeffnen
/// fehlgeschlagen ist; im Fehlerfall ist nichts mehr belegt.
pub fn open_cpal_microphone(
    geraet: Option<String>,
    config: CaptureConfig,
) -> AudioResult<CpalMikrofon> {
    if config.echo_cancellation || config.noise_suppression || config.auto_gain_control {
        debug!(
            echo_cancellation = config.echo_cancellation,
            noise_suppression = config.noise_suppression,
            auto_gain_control = config.auto_gain_control,
            "cpal kann Capture-Constraints nicht anwenden, Rohsignal wird genutzt"
        );
    }

    let rb = HeapRb::<f32>::new(config.buffer_size);
    let (producer, consumer) = rb.split();
    let stream_defekt = Arc::new(AtomicBool::new(false));
    let (bereit_tx, bereit_rx) = std::sync::mpsc::sync_channel::<AudioResult<String>>(1);
    let (stop_tx, stop_rx) = bounded::<()>(1);

    let defekt = Arc::clone(&stream_defekt);
    let thread = std::thread::Builder::new()
        .name("huddle-capture".to_string())
        .spawn(move || {
            let ergebnis = load_cpal_input_device(geraet.as_deref()).and_then(|device| {
                let name = device.name().unwrap_or_default();
                let stream = eingabe_stream_oeffnen(&device, &name, &config, producer, defekt)?;
                Ok((name, stream))
            });
            match ergebnis {
                Ok((name, _stream)) => {
                    if bereit_tx.send(Ok(name)).is_err() {
                        return;
                    }
                    // Stream lebt bis zum Stop-Signal (oder bis der Sender gedroppt wird)
                    let _ = stop_rx.recv();
                }
                Err(e) => {
                    let _ = bereit_tx.send(Err(e));
                }
            }
        })
        .map_err(|e| AudioError::StreamFehler(e.to_string()))?;

    let name = match bereit_rx.recv() {
        Ok(Ok(name)) => name,
        Ok(Err(e)) => {
            let _ = thread.join();
            return Err(e);
        }
        Err(_) => {
            let _ = thread.join();
            return Err(AudioError::StreamFehler(
                "Capture-Thread ohne Rueckmeldung beendet".to_string(),
            ));
        }
    };

    debug!(geraet = %name, "Capture-Stream geoeffnet");
    Ok(CpalMikrofon {
        consumer,
        geraet: name,
        stream_defekt,
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    })
}

fn eingabe_stream_oeffnen(
    device: &Device,
    name: &str,
    config: &CaptureConfig,
    producer: CaptureProducer,
    defekt: Arc<AtomicBool>,
) -> AudioResult<Stream> {
    let rate = config.sample_rate;
    let unterstuetzt = device
        .supported_input_configs()
        .map_err(|e| stream_fehler_einordnen(name, e.to_string()))?
        .filter(|c| c.min_sample_rate().0 <= rate && c.max_sample_rate().0 >= rate)
        .min_by_key(|c| c.channels())
        .ok_or_else(|| {
            AudioError::Konfiguration(format!("'{name}' unterstuetzt keine {rate} Hz"))
        })?
        .with_sample_rate(cpal::SampleRate(rate));

    let stream_config: StreamConfig = unterstuetzt.config();
    let kanaele = stream_config.channels.max(1) as usize;

    let stream = match unterstuetzt.sample_format() {
        cpal::SampleFormat::F32 => {
            mono_stream::<f32>(device, &stream_config, kanaele, producer, defekt)
        }
        cpal::SampleFormat::I16 => {
            mono_stream::<i16>(device, &stream_config, kanaele, producer, defekt)
        }
        cpal::SampleFormat::U16 => {
            mono_stream::<u16>(device, &stream_config, kanaele, producer, defekt)
        }
        anderes => {
            return Err(AudioError::StreamFehler(format!(
                "Nicht unterstuetztes Sample-Format: {anderes:?}"
            )))
        }
    }
    .map_err(|e| stream_fehler_einordnen(name, e.to_string()))?;

    stream
        .play()
        .map_err(|e| stream_fehler_einordnen(name, e.to_string()))?;
    Ok(stream)
}

fn mono_stream<T>(
    device: &Device,
    config: &StreamConfig,
    kanaele: usize,
    mut producer: CaptureProducer,
    defekt: Arc<AtomicBool>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut mono: Vec<f32> = Vec::with_capacity(4096);
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mono.clear();
            for frame in data.chunks(kanaele) {
                let summe: f32 = frame.iter().map(|s| f32::from_sample_(*s)).sum();
                mono.push(summe / kanaele as f32);
            }
            let geschrieben = producer.push_slice(&mono);
            if geschrieben < mono.len() {
                warn!(
                    "Capture Ring-Buffer voll, {} Samples verworfen",
                    mono.len() - geschrieben
                );
            }
        },
        move |err| {
            error!("Capture-Fehler: {}", err);
            defekt.store(true, Ordering::Relaxed);
        },
        None,
    )
}

/// Ordnet Backend-Fehlertexte den Geraetefehlern zu
///
/// cpal liefert Berechtigungs- und Belegt-Fehler nur als Backend-Text.
pub fn stream_fehler_einordnen(geraet: &str, text: String) -> AudioError {
    let klein = text.to_lowercase();
    if klein.contains("permission") || klein.contains("denied") || klein.contains("not permitted")
    {
        AudioError::ZugriffVerweigert(format!("{geraet}: {text}"))
    } else if klein.contains("busy") || klein.contains("in use") || klein.contains("exclusive") {
        AudioError::GeraetBelegt(format!("{geraet}: {text}"))
    } else if klein.contains("not available")
        || klein.contains("no such")
        || klein.contains("not found")
    {
        AudioError::GeraetNichtGefunden(format!("{geraet}: {text}"))
    } else {
        AudioError::StreamFehler(format!("{geraet}: {text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_config_default() {
        let config = CaptureConfig::default();
        assert_eq!(config.sample_rate, 48_000);
        assert!(config.buffer_size > 0);
        assert!(config.echo_cancellation && config.noise_suppression && config.auto_gain_control);
    }

    #[test]
    fn backend_fehler_werden_eingeordnet() {
        assert!(matches!(
            stream_fehler_einordnen("mic", "Permission denied (os error 13)".into()),
            AudioError::ZugriffVerweigert(_)
        ));
        assert!(matches!(
            stream_fehler_einordnen("mic", "Device or resource busy".into()),
            AudioError::GeraetBelegt(_)
        ));
        assert!(matches!(
            stream_fehler_einordnen("mic", "The requested device is no longer available".into()),
            AudioError::GeraetNichtGefunden(_)
        ));
        assert!(matches!(
            stream_fehler_einordnen("mic", "xrun".into()),
            AudioError::StreamFehler(_)
        ));
    }

    #[test]
    #[ignore = "Benoetigt Audio-Hardware"]
    fn capture_stream_oeffnen_und_lesen() {
        let mut mikro = open_cpal_microphone(None, CaptureConfig::default())
            .expect("Capture-Stream sollte oeffenbar sein");
        let mut puffer = Vec::new();
        for _ in 0..20 {
            mikro.lesen(&mut puffer, Duration::from_millis(10)).unwrap();
        }
        assert!(!puffer.is_empty());
    }
}
