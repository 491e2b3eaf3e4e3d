//! Audio-Playback via cpal
//!
//! Wie beim Capture lebt der cpal-Stream in einem eigenen Thread. Der
//! Callback liest aus einem lock-free Ring-Buffer; derselbe Thread fuellt
//! den Buffer in 10-ms-Bloecken aus dem [`OutputMixer`] nach und haelt so
//! einen kleinen Vorrat bereit.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, FromSample, SizedSample, Stream, StreamConfig};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace};

use crate::capture::stream_fehler_einordnen;
use crate::device::load_cpal_output_device;
use crate::error::{AudioError, AudioResult};
use crate::mixer::OutputMixer;

/// Konfiguration fuer den Audio-Playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Abtastrate in Hz
    pub sample_rate: u32,
    /// Ring-Buffer Kapazitaet in Samples (alle Kanaele)
    pub buffer_size: usize,
    /// Vorrat im Ring-Buffer in Millisekunden
    pub vorrat_ms: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            buffer_size: 48_000 * 2,
            vorrat_ms: 20,
        }
    }
}

pub type PlaybackProducer = HeapProd<f32>;
pub type PlaybackConsumer = HeapCons<f32>;

/// Laufender Ausgabe-Stream; Drop beendet ihn
pub struct Lautsprecher {
    geraet: String,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Lautsprecher {
    pub fn geraet(&self) -> &str {
        &self.geraet
    }
}

impl Drop for Lautsprecher {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        debug!(geraet = %self.geraet, "Lautsprecher freigegeben");
    }
}

/// Oeffnet einen Ausgabe-Stream (`None` = Standardgeraet), der `mixer` abspielt
pub fn open_playback_stream(
    geraet: Option<String>,
    config: PlaybackConfig,
    mixer: Arc<Mutex<OutputMixer>>,
) -> AudioResult<Lautsprecher> {
    let (bereit_tx, bereit_rx) = std::sync::mpsc::sync_channel::<AudioResult<String>>(1);
    let (stop_tx, stop_rx) = bounded::<()>(1);

    let thread = std::thread::Builder::new()
        .name("huddle-playback".to_string())
        .spawn(move || {
            let rb = HeapRb::<f32>::new(config.buffer_size);
            let (mut producer, consumer) = rb.split();

            let ergebnis = load_cpal_output_device(geraet.as_deref()).and_then(|device| {
                let name = device.name().unwrap_or_default();
                let (stream, kanaele) = ausgabe_stream_oeffnen(&device, &name, &config, consumer)?;
                Ok((name, stream, kanaele))
            });
            let (name, _stream, kanaele) = match ergebnis {
                Ok(offen) => offen,
                Err(e) => {
                    let _ = bereit_tx.send(Err(e));
                    return;
                }
            };
            if bereit_tx.send(Ok(name)).is_err() {
                return;
            }

            let block = (config.sample_rate / 100) as usize;
            let vorrat = (config.sample_rate * config.vorrat_ms / 1000) as usize * kanaele;
            let mut mono = vec![0.0f32; block];
            let mut verschachtelt = Vec::with_capacity(block * kanaele);

            loop {
                while producer.occupied_len() < vorrat && producer.vacant_len() >= block * kanaele {
                    mixer.lock().render(&mut mono);
                    verschachtelt.clear();
                    for s in &mono {
                        for _ in 0..kanaele {
                            verschachtelt.push(*s);
                        }
                    }
                    producer.push_slice(&verschachtelt);
                }
                match stop_rx.recv_timeout(Duration::from_millis(5)) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
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
                "Playback-Thread ohne Rueckmeldung beendet".to_string(),
            ));
        }
    };

    debug!(geraet = %name, "Playback-Stream geoeffnet");
    Ok(Lautsprecher {
        geraet: name,
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    })
}

fn ausgabe_stream_oeffnen(
    device: &Device,
    name: &str,
    config: &PlaybackConfig,
    consumer: PlaybackConsumer,
) -> AudioResult<(Stream, usize)> {
    let rate = config.sample_rate;
    let unterstuetzt = device
        .supported_output_configs()
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
        cpal::SampleFormat::F32 => ring_stream::<f32>(device, &stream_config, consumer),
        cpal::SampleFormat::I16 => ring_stream::<i16>(device, &stream_config, consumer),
        cpal::SampleFormat::U16 => ring_stream::<u16>(device, &stream_config, consumer),
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
    Ok((stream, kanaele))
}

fn ring_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: PlaybackConsumer,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let mut puffer: Vec<f32> = Vec::with_capacity(8192);
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            puffer.resize(data.len(), 0.0);
            let gelesen = consumer.pop_slice(&mut puffer);
            // Stille fuer fehlende Samples
            if gelesen < data.len() {
                trace!("Playback Underrun: {} Samples fehlen", data.len() - gelesen);
                puffer[gelesen..].fill(0.0);
            }
            for (out, s) in data.iter_mut().zip(puffer.iter()) {
                *out = T::from_sample_(*s);
            }
        },
        |err| error!("Playback-Fehler: {}", err),
        None,
    )
}
