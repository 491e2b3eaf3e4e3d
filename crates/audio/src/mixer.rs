//! Ausgabe-Mixer
//!
//! Alle Wiedergaben (Sprach-Einheiten der Teilnehmer, Sound-Effekte) landen
//! als Quellen im [`OutputMixer`]. Der Ausgabe-Callback ruft
//! [`OutputMixer::render`] auf; dort werden Quellen summiert, per
//! Teilnehmer-Lautstaerke und gemeinsamer Master-Lautstaerke gewichtet und
//! abgeschlossene Quellen gemeldet.

use huddle_core::types::UserId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

/// Herkunft einer Wiedergabe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quelle {
    Peer(UserId),
    Effekt,
}

/// Griff auf eine laufende Wiedergabe
///
/// `fertig` loest bei natuerlichem Ende aus. Wird die Wiedergabe gestoppt,
/// wird der Sender verworfen und der Empfaenger liefert einen Fehler.
#[derive(Debug)]
pub struct PlaybackHandle {
    pub id: u64,
    pub fertig: oneshot::Receiver<()>,
}

/// Ziel fuer dekodierte Wiedergaben
pub trait AudioSink: Send + Sync + 'static {
    /// Spielt `samples` (Mono, Ausgabe-Abtastrate) nach `verzoegerung` ab
    fn abspielen(&self, quelle: Quelle, samples: Vec<f32>, verzoegerung: Duration)
        -> PlaybackHandle;

    /// Bricht eine Wiedergabe sofort ab
    fn stoppen(&self, id: u64);

    /// Bricht alle Wiedergaben sofort ab
    fn alle_stoppen(&self);

    /// Gemeinsame Ausgabe-Lautstaerke (0.0..=1.0)
    fn set_lautstaerke(&self, lautstaerke: f32);

    fn lautstaerke(&self) -> f32;

    /// Lautstaerke eines einzelnen Teilnehmers (0.0..=2.0, 1.0 = normal)
    fn set_peer_lautstaerke(&self, peer: UserId, lautstaerke: f32);
}

// ---------------------------------------------------------------------------
// OutputMixer
// ---------------------------------------------------------------------------

struct AktiveQuelle {
    id: u64,
    quelle: Quelle,
    samples: Vec<f32>,
    pos: usize,
    /// Verbleibende Stille vor dem ersten Sample
    vorlauf: usize,
    fertig: Option<oneshot::Sender<()>>,
}

pub struct OutputMixer {
    sample_rate: u32,
    quellen: Vec<AktiveQuelle>,
    master: f32,
    master_ziel: f32,
    peer_lautstaerke: HashMap<UserId, f32>,
    /// Glaettungskoeffizient fuer Lautstaerke-Uebergaenge
    glaettung: f32,
    naechste_id: u64,
}

impl OutputMixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            quellen: Vec::new(),
            master: 1.0,
            master_ziel: 1.0,
            peer_lautstaerke: HashMap::new(),
            glaettung: 0.995,
            naechste_id: 1,
        }
    }

    pub fn hinzufuegen(
        &mut self,
        quelle: Quelle,
        samples: Vec<f32>,
        verzoegerung: Duration,
    ) -> PlaybackHandle {
        let id = self.naechste_id;
        self.naechste_id += 1;
        let (tx, rx) = oneshot::channel();
        let vorlauf = (verzoegerung.as_secs_f64() * self.sample_rate as f64).round() as usize;
        self.quellen.push(AktiveQuelle {
            id,
            quelle,
            samples,
            pos: 0,
            vorlauf,
            fertig: Some(tx),
        });
        PlaybackHandle { id, fertig: rx }
    }

    pub fn entfernen(&mut self, id: u64) {
        self.quellen.retain(|q| q.id != id);
    }

    pub fn leeren(&mut self) {
        self.quellen.clear();
    }

    pub fn aktive_quellen(&self) -> usize {
        self.quellen.len()
    }

    pub fn set_master(&mut self, lautstaerke: f32) {
        self.master_ziel = lautstaerke.clamp(0.0, 1.0);
    }

    pub fn master(&self) -> f32 {
        self.master_ziel
    }

    pub fn set_peer(&mut self, peer: UserId, lautstaerke: f32) {
        self.peer_lautstaerke.insert(peer, lautstaerke.clamp(0.0, 2.0));
    }

    fn gewicht(&self, quelle: Quelle) -> f32 {
        match quelle {
            Quelle::Peer(id) => *self.peer_lautstaerke.get(&id).unwrap_or(&1.0),
            Quelle::Effekt => 1.0,
        }
    }

    /// Mischt alle Quellen in `out` (Mono) und meldet abgeschlossene Quellen
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);

        for i in 0..self.quellen.len() {
            let gewicht = self.gewicht(self.quellen[i].quelle);
            let q = &mut self.quellen[i];
            let mut ziel = 0;
            let ueberspringen = q.vorlauf.min(out.len());
            q.vorlauf -= ueberspringen;
            ziel += ueberspringen;

            let n = (out.len() - ziel).min(q.samples.len() - q.pos);
            for (o, s) in out[ziel..ziel + n]
                .iter_mut()
                .zip(&q.samples[q.pos..q.pos + n])
            {
                *o += s * gewicht;
            }
            q.pos += n;
        }

        for o in out.iter_mut() {
            self.master = self.glaettung * self.master + (1.0 - self.glaettung) * self.master_ziel;
            *o = (*o * self.master).clamp(-1.0, 1.0);
        }

        self.quellen.retain_mut(|q| {
            let beendet = q.vorlauf == 0 && q.pos >= q.samples.len();
            if beendet {
                trace!(id = q.id, "Wiedergabe beendet");
                if let Some(tx) = q.fertig.take() {
                    let _ = tx.send(());
                }
            }
            !beendet
        });
    }
}

// ---------------------------------------------------------------------------
// MixerSink
// ---------------------------------------------------------------------------

/// `AudioSink` vor einem geteilten `OutputMixer`
#[derive(Clone)]
pub struct MixerSink {
    mixer: Arc<Mutex<OutputMixer>>,
}

impl MixerSink {
    pub fn neu(sample_rate: u32) -> Self {
        Self {
            mixer: Arc::new(Mutex::new(OutputMixer::new(sample_rate))),
        }
    }

    pub fn mixer(&self) -> Arc<Mutex<OutputMixer>> {
        Arc::clone(&self.mixer)
    }
}

impl AudioSink for MixerSink {
    fn abspielen(&self, quelle: Quelle, samples: Vec<f32>, verzoegerung: Duration) -> PlaybackHandle {
        self.mixer.lock().hinzufuegen(quelle, samples, verzoegerung)
    }

    fn stoppen(&self, id: u64) {
        self.mixer.lock().entfernen(id);
    }

    fn alle_stoppen(&self) {
        self.mixer.lock().leeren();
    }

    fn set_lautstaerke(&self, lautstaerke: f32) {
        self.mixer.lock().set_master(lautstaerke);
    }

    fn lautstaerke(&self) -> f32 {
        self.mixer.lock().master()
    }

    fn set_peer_lautstaerke(&self, peer: UserId, lautstaerke: f32) {
        self.mixer.lock().set_peer(peer, lautstaerke);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vorlauf_und_ende() {
        let mut mixer = OutputMixer::new(48_000);
        // 1 ms Verzoegerung = 48 Samples
        let mut handle = mixer.hinzufuegen(Quelle::Effekt, vec![0.5; 100], Duration::from_millis(1));

        let mut out = vec![0.0; 100];
        mixer.render(&mut out);
        assert!(out[..48].iter().all(|&s| s == 0.0));
        assert!(out[48] > 0.4);
        assert!(handle.fertig.try_recv().is_err());

        mixer.render(&mut out);
        assert!(out[..48].iter().all(|&s| s > 0.4));
        assert_eq!(mixer.aktive_quellen(), 0);
        assert!(handle.fertig.try_recv().is_ok());
    }

    #[test]
    fn quellen_werden_summiert_und_begrenzt() {
        let mut mixer = OutputMixer::new(48_000);
        mixer.hinzufuegen(Quelle::Effekt, vec![0.3; 10], Duration::ZERO);
        mixer.hinzufuegen(Quelle::Peer(UserId::new()), vec![0.3; 10], Duration::ZERO);
        mixer.hinzufuegen(Quelle::Peer(UserId::new()), vec![0.9; 10], Duration::ZERO);
        let mut out = vec![0.0; 10];
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn peer_lautstaerke_gewichtet() {
        let mut mixer = OutputMixer::new(48_000);
        let peer = UserId::new();
        mixer.set_peer(peer, 0.5);
        mixer.hinzufuegen(Quelle::Peer(peer), vec![0.4; 8], Duration::ZERO);
        let mut out = vec![0.0; 8];
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| (s - 0.2).abs() < 1e-6));
    }

    #[test]
    fn master_wird_sanft_angepasst() {
        let mut mixer = OutputMixer::new(48_000);
        mixer.set_master(0.0);
        assert_eq!(mixer.master(), 0.0);
        mixer.hinzufuegen(Quelle::Effekt, vec![0.5; 4800], Duration::ZERO);
        let mut out = vec![0.0; 4800];
        mixer.render(&mut out);
        // Kein harter Sprung, aber am Ende fast still
        assert!(out[0] > 0.4);
        assert!(out[4799].abs() < 0.01);
    }

    #[test]
    fn stoppen_verwirft_sender() {
        let sink = MixerSink::neu(48_000);
        let mut handle = sink.abspielen(Quelle::Effekt, vec![0.1; 480], Duration::ZERO);
        sink.stoppen(handle.id);
        assert!(matches!(
            handle.fertig.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));

        let mut a = sink.abspielen(Quelle::Effekt, vec![0.1; 480], Duration::ZERO);
        let mut b = sink.abspielen(Quelle::Effekt, vec![0.1; 480], Duration::ZERO);
        sink.alle_stoppen();
        assert!(a.fertig.try_recv().is_err());
        assert!(b.fertig.try_recv().is_err());
        assert_eq!(sink.mixer().lock().aktive_quellen(), 0);
    }

    #[test]
    fn lautstaerke_wird_begrenzt() {
        let sink = MixerSink::neu(48_000);
        sink.set_lautstaerke(3.0);
        assert_eq!(sink.lautstaerke(), 1.0);
        sink.set_lautstaerke(-1.0);
        assert_eq!(sink.lautstaerke(), 0.0);
    }
}
