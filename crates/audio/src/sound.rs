//! Sound-Effekte laden
//!
//! Clips kommen per HTTP(S) oder aus dem Dateisystem, werden mit symphonia
//! dekodiert, auf Mono gemischt und mit rubato auf die Ausgaberate
//! umgerechnet.
//!
//! Effekte anderer Teilnehmer laufen ueber [`SoundLoader::laden_entfernt`]:
//! nur `http(s)`, mit Zeitlimit und Groessengrenze. Lokale Pfade gibt es nur
//! fuer eigene Effekte.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{AudioError, AudioResult};

/// Groesste akzeptierte Clip-Datei
pub const MAX_CLIP_BYTES: u64 = 8 * 1024 * 1024;

/// Zeitlimit fuer einen Download
pub const LADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Eingangsblock des Resamplers in Frames
const UMRECHNUNG_BLOCK: usize = 1024;

/// Laedt und dekodiert Sound-Effekte
#[derive(Clone)]
pub struct SoundLoader {
    client: reqwest::Client,
    ziel_rate: u32,
    max_bytes: u64,
}

impl SoundLoader {
    pub fn neu(ziel_rate: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LADE_TIMEOUT)
            .connect_timeout(LADE_TIMEOUT / 2)
            .build()
            .unwrap_or_else(|e| {
                warn!(fehler = %e, "HTTP-Client ohne Zeitlimit");
                reqwest::Client::new()
            });
        Self {
            client,
            ziel_rate,
            max_bytes: MAX_CLIP_BYTES,
        }
    }

    /// Setzt die Groessengrenze fuer Clips
    pub fn mit_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Laedt `url` (`http(s)://`, `file://` oder Pfad) als Mono-PCM
    pub async fn laden(&self, url: &str) -> AudioResult<Vec<f32>> {
        let bytes = if ist_http(url) {
            self.herunterladen(url).await?
        } else {
            self.datei_lesen(url.strip_prefix("file://").unwrap_or(url))
                .await?
        };
        self.dekodieren_im_pool(url, bytes).await
    }

    /// Wie [`laden`](Self::laden), aber nur `http(s)`
    pub async fn laden_entfernt(&self, url: &str) -> AudioResult<Vec<f32>> {
        if !ist_http(url) {
            return Err(AudioError::SoundLaden(format!(
                "{url}: nur http(s) erlaubt"
            )));
        }
        let bytes = self.herunterladen(url).await?;
        self.dekodieren_im_pool(url, bytes).await
    }

    async fn herunterladen(&self, url: &str) -> AudioResult<Vec<u8>> {
        let fehler = |e: reqwest::Error| AudioError::SoundLaden(format!("{url}: {e}"));
        let mut antwort = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(fehler)?;

        if let Some(laenge) = antwort.content_length() {
            if laenge > self.max_bytes {
                return Err(zu_gross(url, laenge, self.max_bytes));
            }
        }
        let mut bytes = Vec::new();
        while let Some(teil) = antwort.chunk().await.map_err(fehler)? {
            let laenge = (bytes.len() + teil.len()) as u64;
            if laenge > self.max_bytes {
                return Err(zu_gross(url, laenge, self.max_bytes));
            }
            bytes.extend_from_slice(&teil);
        }
        Ok(bytes)
    }

    async fn datei_lesen(&self, pfad: &str) -> AudioResult<Vec<u8>> {
        let fehler = |e: std::io::Error| AudioError::SoundLaden(format!("{pfad}: {e}"));
        let meta = tokio::fs::metadata(pfad).await.map_err(fehler)?;
        if !meta.is_file() {
            return Err(AudioError::SoundLaden(format!("{pfad}: keine regulaere Datei")));
        }
        if meta.len() > self.max_bytes {
            return Err(zu_gross(pfad, meta.len(), self.max_bytes));
        }

        // Die Datei kann seit der Pruefung gewachsen sein
        let datei = tokio::fs::File::open(pfad).await.map_err(fehler)?;
        let mut bytes = Vec::with_capacity(meta.len() as usize);
        datei
            .take(self.max_bytes + 1)
            .read_to_end(&mut bytes)
            .await
            .map_err(fehler)?;
        if bytes.len() as u64 > self.max_bytes {
            return Err(zu_gross(pfad, bytes.len() as u64, self.max_bytes));
        }
        Ok(bytes)
    }

    async fn dekodieren_im_pool(&self, url: &str, bytes: Vec<u8>) -> AudioResult<Vec<f32>> {
        let endung = endung_aus_url(url);
        let ziel_rate = self.ziel_rate;
        let pcm = tokio::task::spawn_blocking(move || {
            dekodieren(bytes, endung.as_deref(), ziel_rate)
        })
        .await
        .map_err(|e| AudioError::SoundLaden(format!("Dekodier-Task: {e}")))??;

        debug!(url, samples = pcm.len(), "Sound-Effekt geladen");
        Ok(pcm)
    }
}

fn ist_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn zu_gross(quelle: &str, laenge: u64, max: u64) -> AudioError {
    AudioError::SoundLaden(format!("{quelle}: {laenge} Bytes, erlaubt sind {max}"))
}

fn endung_aus_url(url: &str) -> Option<String> {
    let ohne_query = url.split(|c| c == '?' || c == '#').next().unwrap_or(url);
    Path::new(ohne_query)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

/// Dekodiert einen kompletten Clip zu Mono-PCM mit `ziel_rate`
pub fn dekodieren(bytes: Vec<u8>, endung: Option<&str>, ziel_rate: u32) -> AudioResult<Vec<f32>> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let mut hint = Hint::new();
    if let Some(endung) = endung {
        hint.with_extension(endung);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::SoundLaden(format!("Unbekanntes Format: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::SoundLaden("Keine Audiospur".into()))?;
    let track_id = track.id;
    let mut quell_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::SoundLaden(format!("Codec nicht unterstuetzt: {e}")))?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AudioError::SoundLaden(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let dekodiert = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(fehler = e, "Fehlerhaftes Paket im Sound-Effekt uebersprungen");
                continue;
            }
            Err(e) => return Err(AudioError::SoundLaden(e.to_string())),
        };

        let spec = *dekodiert.spec();
        quell_rate.get_or_insert(spec.rate);
        let kanaele = spec.channels.count().max(1);
        let mut puffer = SampleBuffer::<f32>::new(dekodiert.capacity() as u64, spec);
        puffer.copy_interleaved_ref(dekodiert);
        for frame in puffer.samples().chunks(kanaele) {
            mono.push(frame.iter().sum::<f32>() / kanaele as f32);
        }
    }

    let quell_rate = quell_rate.unwrap_or(ziel_rate);
    umrechnen(&mono, quell_rate, ziel_rate)
}

/// Abtastraten-Umrechnung eines ganzen Mono-Clips mit rubato
///
/// Die Ausgabe hat `round(len * nach / von)` Samples; die Filterverzoegerung
/// ist herausgerechnet.
pub fn umrechnen(samples: &[f32], von: u32, nach: u32) -> AudioResult<Vec<f32>> {
    if von == nach || samples.is_empty() || von == 0 || nach == 0 {
        return Ok(samples.to_vec());
    }
    let verhaeltnis = nach as f64 / von as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        oversampling_factor: 256,
        interpolation: SincInterpolationType::Linear,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(verhaeltnis, 2.0, params, UMRECHNUNG_BLOCK, 1)
        .map_err(|e| AudioError::SoundLaden(format!("Resampler: {e}")))?;

    let verzoegerung = resampler.output_delay();
    let erwartet = (samples.len() as f64 * verhaeltnis).round() as usize;

    // Mit Stille auffuellen, bis die Verzoegerung ausgespuelt ist
    let nachlauf = (verzoegerung as f64 / verhaeltnis).ceil() as usize + 1;
    let mut eingabe = samples.to_vec();
    let laenge = (samples.len() + nachlauf).div_ceil(UMRECHNUNG_BLOCK) * UMRECHNUNG_BLOCK;
    eingabe.resize(laenge, 0.0);

    let mut ausgabe = Vec::with_capacity(erwartet + verzoegerung + UMRECHNUNG_BLOCK);
    for block in eingabe.chunks(UMRECHNUNG_BLOCK) {
        let mut kanaele = resampler
            .process(&[block], None)
            .map_err(|e| AudioError::SoundLaden(format!("Resampler: {e}")))?;
        if let Some(kanal) = kanaele.first_mut() {
            ausgabe.append(kanal);
        }
    }

    let ende = (verzoegerung + erwartet).min(ausgabe.len());
    ausgabe.truncate(ende);
    ausgabe.drain(..verzoegerung.min(ende));
    Ok(ausgabe)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimales 16-Bit-PCM-WAV
    fn wav(rate: u32, kanaele: u16, frames: &[i16]) -> Vec<u8> {
        let daten_len = (frames.len() * 2) as u32;
        let mut b = Vec::new();
        b.extend_from_slice(b"RIFF");
        b.extend_from_slice(&(36 + daten_len).to_le_bytes());
        b.extend_from_slice(b"WAVEfmt ");
        b.extend_from_slice(&16u32.to_le_bytes());
        b.extend_from_slice(&1u16.to_le_bytes());
        b.extend_from_slice(&kanaele.to_le_bytes());
        b.extend_from_slice(&rate.to_le_bytes());
        b.extend_from_slice(&(rate * kanaele as u32 * 2).to_le_bytes());
        b.extend_from_slice(&(kanaele * 2).to_le_bytes());
        b.extend_from_slice(&16u16.to_le_bytes());
        b.extend_from_slice(b"data");
        b.extend_from_slice(&daten_len.to_le_bytes());
        for s in frames {
            b.extend_from_slice(&s.to_le_bytes());
        }
        b
    }

    fn sinus(rate: u32, frequenz: f32, laenge: usize) -> Vec<f32> {
        (0..laenge)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * frequenz * i as f32 / rate as f32).sin())
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn umrechnung_verdoppelt_laenge() {
        let ein = sinus(24_000, 440.0, 2400);
        let aus = umrechnen(&ein, 24_000, 48_000).unwrap();
        assert_eq!(aus.len(), 4800);
        // Pegel bleibt erhalten (Rand wegen Einschwingen ausgelassen)
        let mitte = &aus[1000..3800];
        assert!((rms(mitte) - rms(&ein[500..1900])).abs() < 0.02);
    }

    #[test]
    fn umrechnung_nach_unten() {
        let ein = sinus(44_100, 440.0, 4410);
        let aus = umrechnen(&ein, 44_100, 48_000).unwrap();
        assert_eq!(aus.len(), 4800);
        let aus = umrechnen(&ein, 44_100, 16_000).unwrap();
        assert_eq!(aus.len(), 1600);
    }

    #[test]
    fn gleiche_rate_unveraendert() {
        assert_eq!(umrechnen(&[0.1, 0.2], 48_000, 48_000).unwrap(), vec![0.1, 0.2]);
        assert!(umrechnen(&[], 24_000, 48_000).unwrap().is_empty());
    }

    #[test]
    fn wav_stereo_wird_mono_48k() {
        // 0.1 s Stereo bei 24 kHz, links und rechts gleich
        let frames: Vec<i16> = (0..2400).flat_map(|_| [8192i16, 8192]).collect();
        let pcm = dekodieren(wav(24_000, 2, &frames), Some("wav"), 48_000).unwrap();
        assert_eq!(pcm.len(), 4800);
        assert!((pcm[2400] - 0.25).abs() < 0.02);
    }

    #[test]
    fn muell_ist_ladefehler() {
        assert!(matches!(
            dekodieren(vec![1, 2, 3, 4], None, 48_000),
            Err(AudioError::SoundLaden(_))
        ));
    }

    #[test]
    fn endung_ohne_query() {
        assert_eq!(
            endung_aus_url("https://cdn.example.org/sfx/tada.MP3?v=2").as_deref(),
            Some("mp3")
        );
        assert_eq!(endung_aus_url("/tmp/klick"), None);
    }

    #[tokio::test]
    async fn lokale_datei_laden() {
        let pfad = std::env::temp_dir().join(format!("huddle-sfx-{}.wav", std::process::id()));
        std::fs::write(&pfad, wav(48_000, 1, &[4096i16; 480])).unwrap();

        let loader = SoundLoader::neu(48_000);
        let pcm = loader
            .laden(&format!("file://{}", pfad.display()))
            .await
            .unwrap();
        assert_eq!(pcm.len(), 480);
        std::fs::remove_file(&pfad).unwrap();

        assert!(loader.laden("/gibt/es/nicht.wav").await.is_err());
    }

    #[tokio::test]
    async fn entfernt_nur_http() {
        let pfad = std::env::temp_dir().join(format!("huddle-sfx-fremd-{}.wav", std::process::id()));
        std::fs::write(&pfad, wav(48_000, 1, &[4096i16; 480])).unwrap();
        let loader = SoundLoader::neu(48_000);

        for url in [
            format!("file://{}", pfad.display()),
            pfad.display().to_string(),
            "file:///dev/zero".to_string(),
            "ftp://cdn.example.org/tusch.wav".to_string(),
        ] {
            match loader.laden_entfernt(&url).await {
                Err(AudioError::SoundLaden(text)) => assert!(text.contains("http(s)"), "{text}"),
                andere => panic!("{url}: {andere:?}"),
            }
        }
        // Lokal bleibt die Datei nutzbar
        assert_eq!(loader.laden(&pfad.display().to_string()).await.unwrap().len(), 480);
        std::fs::remove_file(&pfad).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn geraetedateien_werden_nicht_gelesen() {
        let loader = SoundLoader::neu(48_000);
        let ergebnis = tokio::time::timeout(Duration::from_secs(2), loader.laden("/dev/zero"))
            .await
            .expect("darf nicht endlos lesen");
        assert!(matches!(ergebnis, Err(AudioError::SoundLaden(_))));
    }

    #[tokio::test]
    async fn zu_grosse_datei_wird_abgelehnt() {
        let pfad = std::env::temp_dir().join(format!("huddle-sfx-gross-{}.wav", std::process::id()));
        std::fs::write(&pfad, wav(48_000, 1, &[0i16; 4800])).unwrap();

        let loader = SoundLoader::neu(48_000).mit_max_bytes(1024);
        let ergebnis = loader.laden(&pfad.display().to_string()).await;
        std::fs::remove_file(&pfad).unwrap();
        match ergebnis {
            Err(AudioError::SoundLaden(text)) => assert!(text.contains("1024"), "{text}"),
            andere => panic!("{andere:?}"),
        }
    }

    /// Ohne Proxy aus der Umgebung, der Server laeuft lokal
    fn direkter_loader() -> SoundLoader {
        SoundLoader {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            ..SoundLoader::neu(48_000)
        }
    }

    /// Beantwortet genau eine HTTP-Anfrage mit `koerper`
    async fn http_server(koerper: Vec<u8>) -> String {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let adresse = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut anfrage = [0u8; 1024];
            let _ = stream.read(&mut anfrage).await;
            let kopf = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: audio/wav\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                koerper.len()
            );
            let _ = stream.write_all(kopf.as_bytes()).await;
            let _ = stream.write_all(&koerper).await;
            let _ = stream.shutdown().await;
        });
        format!("http://{adresse}/tusch.wav")
    }

    #[tokio::test]
    async fn http_clip_laden() {
        let url = http_server(wav(48_000, 1, &[4096i16; 480])).await;
        let pcm = direkter_loader().laden_entfernt(&url).await.unwrap();
        assert_eq!(pcm.len(), 480);
    }

    #[tokio::test]
    async fn http_clip_ueber_grenze() {
        let url = http_server(wav(48_000, 1, &[0i16; 4800])).await;
        let loader = direkter_loader().mit_max_bytes(1024);
        assert!(matches!(
            loader.laden_entfernt(&url).await,
            Err(AudioError::SoundLaden(_))
        ));
    }
}
