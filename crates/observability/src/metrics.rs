//! Prometheus-kompatible Metriken fuer huddle
//!
//! Registrierte Metriken:
//! - `huddle_chunks_empfangen_total` – Counter: Eingegangene Audio-Chunks
//! - `huddle_chunks_verworfen_total` – Counter: Wegen Puffer-Ueberlauf verworfene Chunks
//! - `huddle_chunks_gesendet_total` – Counter: Gesendete eigene Chunks
//! - `huddle_flushes_total` – Counter: Flush-Einheiten (Label `grund`: ziel/max_warten)
//! - `huddle_flushes_uebersprungen_total` – Counter: Flushes, die wegen laufender Wiedergabe warten
//! - `huddle_dekodierfehler_total` – Counter: Verworfene Einheiten nach Dekodierfehler
//! - `huddle_flush_einheit_sekunden` – Histogram: Audiodauer einer Flush-Einheit
//! - `huddle_peers_aktiv` – Gauge: Teilnehmer mit Audio-Zustand
//! - `huddle_peers_sprechend` – Gauge: Aktuell sprechende Teilnehmer

use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Alle Voice-Metriken einer Engine-Instanz
#[derive(Clone)]
pub struct VoiceMetrics {
    pub registry: Arc<Registry>,

    pub chunks_empfangen: IntCounter,
    pub chunks_verworfen: IntCounter,
    pub chunks_gesendet: IntCounter,
    pub flushes: IntCounterVec,
    pub flushes_uebersprungen: IntCounter,
    pub dekodierfehler: IntCounter,
    pub flush_einheit_sekunden: Histogram,
    pub peers_aktiv: IntGauge,
    pub peers_sprechend: IntGauge,
}

impl VoiceMetrics {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        let chunks_empfangen = IntCounter::with_opts(Opts::new(
            "huddle_chunks_empfangen_total",
            "Anzahl eingegangener Audio-Chunks",
        ))?;
        registry.register(Box::new(chunks_empfangen.clone()))?;

        let chunks_verworfen = IntCounter::with_opts(Opts::new(
            "huddle_chunks_verworfen_total",
            "Wegen Puffer-Ueberlauf verworfene Chunks",
        ))?;
        registry.register(Box::new(chunks_verworfen.clone()))?;

        let chunks_gesendet = IntCounter::with_opts(Opts::new(
            "huddle_chunks_gesendet_total",
            "Anzahl gesendeter eigener Audio-Chunks",
        ))?;
        registry.register(Box::new(chunks_gesendet.clone()))?;

        let flushes = IntCounterVec::new(
            Opts::new("huddle_flushes_total", "Anzahl abgegebener Flush-Einheiten"),
            &["grund"],
        )?;
        registry.register(Box::new(flushes.clone()))?;

        let flushes_uebersprungen = IntCounter::with_opts(Opts::new(
            "huddle_flushes_uebersprungen_total",
            "Faellige Flushes, die wegen laufender Wiedergabe warten",
        ))?;
        registry.register(Box::new(flushes_uebersprungen.clone()))?;

        let dekodierfehler = IntCounter::with_opts(Opts::new(
            "huddle_dekodierfehler_total",
            "Wegen Dekodierfehler verworfene Flush-Einheiten",
        ))?;
        registry.register(Box::new(dekodierfehler.clone()))?;

        let flush_einheit_sekunden = Histogram::with_opts(
            HistogramOpts::new(
                "huddle_flush_einheit_sekunden",
                "Audiodauer einer Flush-Einheit in Sekunden",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.15, 0.2, 0.3, 0.5, 1.0]),
        )?;
        registry.register(Box::new(flush_einheit_sekunden.clone()))?;

        let peers_aktiv = IntGauge::with_opts(Opts::new(
            "huddle_peers_aktiv",
            "Teilnehmer mit Audio-Zustand in der Sitzung",
        ))?;
        registry.register(Box::new(peers_aktiv.clone()))?;

        let peers_sprechend = IntGauge::with_opts(Opts::new(
            "huddle_peers_sprechend",
            "Aktuell sprechende Teilnehmer",
        ))?;
        registry.register(Box::new(peers_sprechend.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            chunks_empfangen,
            chunks_verworfen,
            chunks_gesendet,
            flushes,
            flushes_uebersprungen,
            dekodierfehler,
            flush_einheit_sekunden,
            peers_aktiv,
            peers_sprechend,
        })
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metriken_erstellen_erfolgreich() {
        let metriken = VoiceMetrics::neu().unwrap();
        assert!(!metriken.registry.gather().is_empty());
    }

    #[test]
    fn zwei_instanzen_kollidieren_nicht() {
        // Jede Instanz hat ihre eigene Registry
        let a = VoiceMetrics::neu().unwrap();
        let b = VoiceMetrics::neu().unwrap();
        a.chunks_empfangen.inc();
        assert_eq!(b.chunks_empfangen.get(), 0);
    }

    #[test]
    fn flush_counter_mit_grund() {
        let metriken = VoiceMetrics::neu().unwrap();
        metriken.flushes.with_label_values(&["ziel"]).inc();
        metriken.flushes.with_label_values(&["max_warten"]).inc_by(2);
        assert_eq!(metriken.flushes.with_label_values(&["ziel"]).get(), 1);
        assert_eq!(metriken.flushes.with_label_values(&["max_warten"]).get(), 2);
    }

    #[test]
    fn gauges_setzen() {
        let metriken = VoiceMetrics::neu().unwrap();
        metriken.peers_aktiv.set(3);
        metriken.peers_sprechend.inc();
        metriken.peers_sprechend.dec();
        assert_eq!(metriken.peers_aktiv.get(), 3);
        assert_eq!(metriken.peers_sprechend.get(), 0);
    }

    #[test]
    fn metriken_export_prometheus_format() {
        let metriken = VoiceMetrics::neu().unwrap();
        metriken.chunks_empfangen.inc_by(20);
        metriken.flush_einheit_sekunden.observe(0.15);

        let output = metriken.exportieren().unwrap();
        assert!(output.contains("huddle_chunks_empfangen_total 20"));
        assert!(output.contains("huddle_flush_einheit_sekunden_bucket"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }
}
