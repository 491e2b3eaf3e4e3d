//! huddle – Kommandozeilen-Client
//!
//! Laedt die Konfiguration, initialisiert das Logging und tritt einem Raum
//! bei. Befehle kommen zeilenweise von stdin, Ctrl-C verlaesst den Raum.

mod args;

use anyhow::{Context, Result};
use args::{Argumente, Befehl, Eingabe, HILFE};
use clap::Parser;
use huddle_audio::{
    open_playback_stream, AudioSink, CpalBackend, DeviceBackend, DeviceRegistry, GeraeteWaechter,
    Lautsprecher, MixerSink, OpusCodec, OutputMixer, PlaybackConfig, VirtuellerSink,
    VirtuellesBackend,
};
use huddle_core::types::{RoomId, UserId};
use huddle_observability::{logging_initialisieren, VoiceMetrics};
use huddle_voice::{
    AudioSession, HuddleConfig, SessionBausteine, SessionEvent, SessionState, TcpTransport,
    Transport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

#[tokio::main]
async fn main() -> Result<()> {
    let argumente = Argumente::parse();

    let config_pfad = HuddleConfig::pfad_bestimmen(argumente.config.clone());
    let config = HuddleConfig::laden(&config_pfad)?;

    logging_initialisieren(&config.logging.level, &config.logging.format);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        headless = argumente.headless,
        "huddle wird initialisiert"
    );

    let backend: Arc<dyn DeviceBackend> = if argumente.headless {
        Arc::new(VirtuellesBackend::neu())
    } else {
        Arc::new(CpalBackend)
    };
    let registry = DeviceRegistry::neu(backend, config.audio.capture.clone());

    match argumente.befehl {
        Befehl::Geraete => {
            geraete_auflisten(&registry);
            Ok(())
        }
        Befehl::Beitreten { raum, benutzer } => {
            let benutzer = benutzer.unwrap_or_default();
            sitzung(config, registry, argumente.headless, raum, benutzer).await
        }
    }
}

fn geraete_auflisten(registry: &DeviceRegistry) {
    println!("Eingabegeraete:");
    for geraet in registry.list_inputs() {
        println!("  {:<40} {}", geraet.id, geraet.label);
    }
    println!("Ausgabegeraete:");
    for geraet in registry.list_outputs() {
        println!("  {:<40} {}", geraet.id, geraet.label);
    }
}

/// Haelt Hardware-Ressourcen fuer die Dauer der Sitzung
#[derive(Default)]
struct Hardware {
    lautsprecher: Option<Lautsprecher>,
    mixer: Option<Arc<Mutex<OutputMixer>>>,
    _waechter: Option<GeraeteWaechter>,
}

impl Hardware {
    /// Oeffnet die aktuell gewaehlte Ausgabe; eine offene wird vorher geschlossen
    fn ausgabe_oeffnen(&mut self, registry: &DeviceRegistry, config: &PlaybackConfig) -> Result<()> {
        let Some(mixer) = &self.mixer else {
            return Ok(());
        };
        self.lautsprecher = None;
        let geraet = registry.aktueller_ausgang();
        let lautsprecher = open_playback_stream(geraet.clone(), config.clone(), Arc::clone(mixer))
            .with_context(|| {
                let name = geraet.as_deref().unwrap_or("Standard");
                format!("Ausgabegeraet {name} nicht verfuegbar")
            })?;
        tracing::info!(geraet = lautsprecher.geraet(), "Ausgabe geoeffnet");
        self.lautsprecher = Some(lautsprecher);
        Ok(())
    }
}

async fn sitzung(
    config: HuddleConfig,
    registry: DeviceRegistry,
    headless: bool,
    raum: RoomId,
    benutzer: UserId,
) -> Result<()> {
    if let Some(id) = &config.audio.eingabegeraet {
        if let Err(e) = registry.select_input(id) {
            tracing::warn!(geraet = %id, fehler = %e, "Konfiguriertes Eingabegeraet nicht nutzbar, nutze Standard");
        }
    }
    if let Some(id) = &config.audio.ausgabegeraet {
        if let Err(e) = registry.select_output(id) {
            tracing::warn!(geraet = %id, fehler = %e, "Konfiguriertes Ausgabegeraet nicht nutzbar, nutze Standard");
        }
    }

    let sample_rate = config.wiedergabe.ausgabe.sample_rate;
    let ausgabe_config = config.wiedergabe.ausgabe.clone();
    let mut hardware = Hardware::default();
    let (ausgang_tx, mut ausgang_rx) = mpsc::unbounded_channel::<()>();
    let sink: Arc<dyn AudioSink> = if headless {
        Arc::new(VirtuellerSink::neu(sample_rate))
    } else {
        let mixer_sink = MixerSink::neu(sample_rate);
        hardware.mixer = Some(mixer_sink.mixer());
        hardware.ausgabe_oeffnen(&registry, &ausgabe_config)?;
        registry.on_change(move |aenderung| {
            if aenderung.ausgang_betroffen {
                let _ = ausgang_tx.send(());
            }
        });
        hardware._waechter = Some(
            registry.beobachten(Duration::from_millis(config.audio.geraete_intervall_ms))?,
        );
        Arc::new(mixer_sink)
    };
    let ausgabe_registry = registry.clone();

    let timeout = Duration::from_millis(config.transport.verbindungs_timeout_ms);
    let transport = tokio::time::timeout(timeout, TcpTransport::verbinden(&config.transport.server))
        .await
        .with_context(|| format!("Zeitueberschreitung bei {}", config.transport.server))??;
    let transport = Arc::new(transport);

    let metriken = VoiceMetrics::neu()?;
    let codec = OpusCodec::neu(config.audio.codec.clone())?;
    let session = AudioSession::neu(
        config,
        SessionBausteine {
            registry,
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            codec: Arc::new(codec),
            sink,
            metriken: Some(metriken),
        },
    );
    session.on_forcibly_removed(|grund, gebannt| {
        let art = if gebannt { "gebannt" } else { "entfernt" };
        eprintln!("Du wurdest aus dem Raum {art}: {}", grund.unwrap_or("kein Grund angegeben"));
    });

    let mut ereignisse = session.subscribe();
    session.join(raum, benutzer).await?;
    println!("Raum {raum} als {benutzer} beigetreten. {HILFE}");

    let mut zeilen = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_offen = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C empfangen");
                break;
            }
            ereignis = ereignisse.recv() => match ereignis {
                Ok(ereignis) => {
                    ereignis_anzeigen(&ereignis);
                    // Idle ohne Verbindung ist endgueltig; beim Geraetewechsel folgt ein neuer Beitritt
                    let beendet = matches!(ereignis, SessionEvent::Entfernt { .. })
                        || (ereignis == SessionEvent::ZustandGeaendert(SessionState::Idle)
                            && !transport.ist_verbunden());
                    if beendet {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(verpasst = n, "Ereignisse uebersprungen");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            zeile = zeilen.next_line(), if stdin_offen => {
                let Some(zeile) = zeile? else {
                    stdin_offen = false;
                    continue;
                };
                let Some(eingabe) = Eingabe::parsen(&zeile) else { continue };
                if !eingabe_ausfuehren(&session, &ausgabe_registry, eingabe).await {
                    break;
                }
            }
            Some(()) = ausgang_rx.recv() => {
                if let Err(e) = hardware.ausgabe_oeffnen(&ausgabe_registry, &ausgabe_config) {
                    eprintln!("Ausgabe nicht wieder geoeffnet: {e:#}");
                }
            }
        }
    }

    if session.state() == SessionState::Active {
        session.leave().await?;
    }
    session.shutdown();
    drop(hardware);
    Ok(())
}

/// Liefert `false`, wenn die Sitzung beendet werden soll
async fn eingabe_ausfuehren(
    session: &AudioSession,
    registry: &DeviceRegistry,
    eingabe: Eingabe,
) -> bool {
    match eingabe {
        Eingabe::Stumm => session.set_muted(true).await,
        Eingabe::Laut => session.set_muted(false).await,
        Eingabe::Sound(url) => {
            if let Err(e) = session.play_sound_effect(&url).await {
                eprintln!("Sound-Effekt fehlgeschlagen: {e}");
            }
        }
        Eingabe::Lautstaerke(wert) => session.set_output_volume(wert),
        Eingabe::Eingang(id) => {
            if let Err(e) = session.eingabe_wechseln(&id).await {
                eprintln!("Eingabegeraet nicht gewechselt: {e}");
            }
        }
        // Der Lautsprecher wird ueber `ausgang_betroffen` neu geoeffnet
        Eingabe::Ausgabe(id) => {
            if let Err(e) = registry.select_output(&id) {
                eprintln!("Ausgabegeraet nicht gewechselt: {e}");
            }
        }
        Eingabe::Peers => {
            for peer in session.peers() {
                println!(
                    "  {} spricht={} gepuffert={} spielt={} zuletzt vor {} ms",
                    peer.user_id,
                    peer.spricht,
                    peer.gepuffert,
                    peer.spielt,
                    peer.zuletzt_gesehen.elapsed().as_millis()
                );
            }
        }
        Eingabe::Metriken => match session.metriken().map(VoiceMetrics::exportieren) {
            Some(Ok(text)) => println!("{text}"),
            Some(Err(e)) => eprintln!("Metriken nicht exportierbar: {e}"),
            None => {}
        },
        Eingabe::Verlassen => return false,
        Eingabe::Hilfe => println!("{HILFE}"),
        Eingabe::Unbekannt(zeile) => eprintln!("Unbekannt: {zeile}. {HILFE}"),
    }
    true
}

fn ereignis_anzeigen(ereignis: &SessionEvent) {
    match ereignis {
        SessionEvent::Sprechend { user_id, spricht } => {
            println!("{user_id} {}", if *spricht { "spricht" } else { "schweigt" });
        }
        SessionEvent::PeerBeigetreten(id) => println!("{id} ist im Raum"),
        SessionEvent::PeerVerlassen(id) => println!("{id} hat den Raum verlassen"),
        SessionEvent::PeerStumm { user_id, stumm } => {
            println!("{user_id} {}", if *stumm { "stumm" } else { "laut" });
        }
        SessionEvent::StummGeaendert(stumm) => {
            println!("Mikrofon {}", if *stumm { "stumm" } else { "aktiv" });
        }
        SessionEvent::Hinweis(text) => println!("Hinweis: {text}"),
        SessionEvent::Entfernt { .. } | SessionEvent::ZustandGeaendert(_) => {
            tracing::debug!(?ereignis, "Sitzungsereignis");
        }
    }
}
