//! huddle-audio – Client Audio Engine
//!
//! Geraete, Mikrofon-Capture, Opus, Effekt-Kette und Ausgabe:
//! - Geraete-Registry mit Hot-Swap-Erkennung
//! - Mikrofon-Capture via cpal, 10-ms-Opus-Chunks
//! - Wiedergabe-Kette Kompressor -> Bandpass -> High-Shelf
//! - Ausgabe-Mixer mit Master- und Teilnehmer-Lautstaerke, Playback via cpal
//! - Sound-Effekte laden (HTTP oder Datei, symphonia)
//! - Virtuelles Backend und Sink fuer Betrieb ohne Hardware

pub mod capture;
pub mod capture_session;
pub mod codec;
pub mod device;
pub mod dsp;
pub mod error;
pub mod mixer;
pub mod pipeline;
pub mod playback;
pub mod sound;
pub mod virtuell;

// Bequeme Re-Exporte der wichtigsten Typen
pub use capture::{open_cpal_microphone, CaptureConfig, MicrophoneStream};
pub use capture_session::{AnalyseAbgriff, CaptureProcessor, CaptureSession};
pub use codec::{
    einheit_dekodieren, AudioDecoder, AudioEncoder, CodecFactory, EncodedChunk, OpusCodec,
    OpusDecoder, OpusEncoder,
};
pub use device::{
    CallbackId, CpalBackend, DeviceBackend, DeviceDescriptor, DeviceKind, DeviceRegistry,
    GeraeteAenderung, GeraeteWaechter,
};
pub use dsp::{rms, AudioProcessor};
pub use error::{AudioError, AudioResult};
pub use mixer::{AudioSink, MixerSink, OutputMixer, PlaybackHandle, Quelle};
pub use pipeline::{AudioPipeline, EffektConfig};
pub use playback::{open_playback_stream, Lautsprecher, PlaybackConfig};
pub use sound::SoundLoader;
pub use virtuell::{VirtuellerFehler, VirtuellerSink, VirtuellesBackend};
