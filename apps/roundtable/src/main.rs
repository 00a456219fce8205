mod config;
mod graph;
mod manager;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use roundtable_audio::devices::{self, MicrophoneSource, SpeakerSink};
use roundtable_audio::{Sink, Source};
use roundtable_peer::{PeerConfig, PeerFactory};
use roundtable_signalling::SignalServer;
use roundtable_transport::memory::MemoryTransportFactory;
use tracing_subscriber::EnvFilter;

use config::{Cli, Config};
use graph::AudioGraph;
use manager::ConnectionManager;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.list_devices {
        return list_devices();
    }

    let config = match Config::resolve(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    let _log_guard = match init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("cannot initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal");
            eprintln!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn list_devices() -> ExitCode {
    let inputs = devices::list_input_devices();
    let outputs = devices::list_output_devices();
    match (inputs, outputs) {
        (Ok(inputs), Ok(outputs)) => {
            println!("Input devices:");
            for d in inputs {
                println!("  {}{}", d.name, if d.is_default { " (default)" } else { "" });
            }
            println!("Output devices:");
            for d in outputs {
                println!("  {}{}", d.name, if d.is_default { " (default)" } else { "" });
            }
            ExitCode::SUCCESS
        }
        (inputs, outputs) => {
            if let Err(e) = inputs {
                eprintln!("cannot list input devices: {e}");
            }
            if let Err(e) = outputs {
                eprintln!("cannot list output devices: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(
    config: &Config,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.loglevel.filter()));

    match &config.logfile {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating log file {path}"))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

async fn run(config: Config, cli: Cli) -> anyhow::Result<()> {
    let mic = MicrophoneSource::open(cli.input_device.as_deref())
        .context("opening capture device")?;
    let speaker = SpeakerSink::open(cli.output_device.as_deref())
        .context("opening playback device")?;

    let capture = mic.properties();
    let playback = Sink::properties(&speaker);
    tracing::info!(capture = ?capture, playback = ?playback, "devices open");

    let peer_config = PeerConfig {
        codecs: config.codecs.clone(),
        frame_duration: config.frame_duration,
        safety_factor: config.safety_factor,
        capture_properties: capture,
        playback_properties: playback,
    };

    // The session layer here is the in-process loopback implementation; a
    // networked transport plugs in through the same factory seam.
    let (manager, peers_rx) = ConnectionManager::new(
        &config.signalling_server,
        config.timeout,
        &config.public_ip,
        config.ice_servers.clone(),
        PeerFactory::new(peer_config),
        Arc::new(MemoryTransportFactory),
    )?;

    let server = SignalServer::bind(config.localport, manager.offer_handler())
        .await
        .context("binding signal endpoint")?;

    let graph = Arc::new(AudioGraph::new(
        Box::new(mic),
        Box::new(speaker),
        config.frame_duration.as_duration(),
    )?);
    tokio::spawn(graph.clone().run(peers_rx));

    tracing::info!(port = server.local_addr().port(), "roundtable ready");
    println!(
        "Share this identifier to be dialed:\n{}",
        manager.local_identifier().encode()
    );

    if let Some(target) = &cli.dial {
        let peer = manager.dial(target).await.context("dialing peer")?;
        println!("Connected to {}", peer.uuid());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    graph.close();
    server.shutdown();
    Ok(())
}
