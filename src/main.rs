use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use voxrelay::audio::{AudioFrame, AudioOutput, AudioSystem, MicSource, WavFileSource};
use voxrelay::config::Config;
use voxrelay::contribution::{Contributor, Submission};
use voxrelay::controller::{CoreController, UiEvent};
use voxrelay::identity::{HttpIdentityVerifier, IdentityVerifier};
use voxrelay::net_link::{AgentLink, NetEvent};
use voxrelay::protocol::ClientMessage;
use voxrelay::relay::RelayServer;

#[derive(Parser)]
#[command(name = "voxrelay")]
#[command(about = "Voice agent relay and reference client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept browser connections and relay them to the agent
    Relay {
        /// Override the listen address
        #[arg(long)]
        listen: Option<String>,
        /// Override the agent endpoint
        #[arg(long)]
        agent: Option<String>,
    },
    /// Talk to the agent through the relay
    Client {
        /// WAV file used as microphone input
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Text message sent right after connecting
        #[arg(long)]
        say: Option<String>,
        /// Keep the capture and submit it as a contribution of this contributor
        #[arg(long)]
        contributor: Option<String>,
        /// Corpus sentence id for guided recordings
        #[arg(long)]
        sentence_id: Option<String>,
        /// Transcript of the recorded sentence
        #[arg(long)]
        transcript: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，RUST_LOG 可覆盖默认级别
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // 加载配置
    let mut config = Config::new().unwrap_or_default();
    config.apply_env_overrides();

    match cli.command {
        Command::Relay { listen, agent } => {
            if let Some(listen) = listen {
                config.relay.listen_addr = listen;
            }
            if let Some(agent) = agent {
                config.relay.agent_url = agent;
            }
            run_relay(config).await
        }
        Command::Client {
            input,
            say,
            contributor,
            sentence_id,
            transcript,
        } => {
            let submission = contributor.map(|contributor_id| Submission {
                contributor_id,
                sentence_id,
                transcript,
                metadata: serde_json::json!({ "source": "voxrelay-client" }),
            });
            run_client(config, input, say, submission).await
        }
    }
}

async fn run_relay(config: Config) -> anyhow::Result<()> {
    let verifier = HttpIdentityVerifier::from_config(&config.identity)
        .map(|v| Arc::new(v) as Arc<dyn IdentityVerifier>);
    if verifier.is_none() {
        warn!("No identity provider configured, all sessions are anonymous");
    }

    let server = RelayServer::new(config.relay, verifier);
    tokio::select! {
        res = server.serve() => res,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    }
}

fn open_output(config: &Config) -> Box<dyn AudioOutput> {
    #[cfg(feature = "alsa")]
    {
        Box::new(voxrelay::audio::AlsaOutput::new(config.audio.playback_device.clone()))
    }
    #[cfg(not(feature = "alsa"))]
    {
        let _ = config;
        Box::new(voxrelay::audio::PacedSilentOutput)
    }
}

fn open_source(config: &Config, input: Option<PathBuf>) -> anyhow::Result<Option<Box<dyn MicSource>>> {
    if let Some(path) = input {
        let source = WavFileSource::open(&path, true)
            .with_context(|| format!("Failed to open input {}", path.display()))?;
        return Ok(Some(Box::new(source)));
    }
    #[cfg(feature = "alsa")]
    {
        let mic = voxrelay::audio::AlsaMic::open(&config.audio.capture_device, config.audio.capture_sample_rate)?;
        Ok(Some(Box::new(mic)))
    }
    #[cfg(not(feature = "alsa"))]
    {
        let _ = config;
        Ok(None)
    }
}

async fn run_client(
    config: Config,
    input: Option<PathBuf>,
    say: Option<String>,
    submission: Option<Submission>,
) -> anyhow::Result<()> {
    let mut audio = AudioSystem::start(config.audio.clone(), open_output(&config))?;
    let playback_tx = audio
        .playback_sender()
        .context("playback queue is not running")?;
    let mut controller = CoreController::new(playback_tx);

    let (mut link, mut rx_net_event) = AgentLink::connect(&config.client).await?;

    if let Some(text) = say {
        link.send_message(&ClientMessage::text(text)).await?;
    }

    // 采集通道：音频线程 -> 网络
    let (tx_frame, mut rx_frame) = mpsc::channel::<AudioFrame>(32);
    let mut capturing = false;
    let mut level_rx = None;
    if let Some(source) = open_source(&config, input)? {
        level_rx = Some(audio.start_capture(source, tx_frame, submission.is_some())?);
        capturing = true;
    } else {
        drop(tx_frame);
    }

    info!("Client started. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }

            event = rx_net_event.recv() => {
                let Some(event) = event else { break };
                let terminal = matches!(event, NetEvent::Failed { .. });
                for ui in controller.handle_net_event(event) {
                    render(&ui);
                }
                if terminal {
                    break;
                }
            }

            frame = rx_frame.recv(), if capturing => match frame {
                Some(frame) => {
                    if let Err(e) = link.send_audio(&frame.to_le_bytes()).await {
                        debug!("Audio frame not sent: {}", e);
                    }
                }
                None => {
                    info!("Capture finished, ending audio turn");
                    capturing = false;
                    if let Err(e) = link.send_message(&ClientMessage::EndAudio).await {
                        warn!("Failed to send end_audio: {}", e);
                    }
                }
            },

            changed = wait_level(&mut level_rx) => {
                if changed.is_err() {
                    level_rx = None;
                } else if let Some(rx) = &level_rx {
                    let level = *rx.borrow();
                    debug!("mic level rms={:.3} peak={:.3}", level.rms, level.peak);
                }
            }
        }
    }

    let recording = audio.stop_capture()?;
    if link.is_connected() {
        let _ = link.send_message(&ClientMessage::EndSession { summary: None }).await;
    }
    link.disconnect().await;

    if let (Some(recording), Some(submission)) = (recording, submission) {
        let contributor = Contributor::from_config(&config.storage);
        match contributor.submit(&recording, &submission).await {
            Ok(outcome) => info!("Contribution: {:?}", outcome),
            Err(e) => warn!("Contribution failed: {}", e),
        }
    }

    drop(controller);
    audio.finish()?;
    info!("Client stopped");
    Ok(())
}

async fn wait_level(
    rx: &mut Option<tokio::sync::watch::Receiver<voxrelay::audio::Level>>,
) -> Result<(), tokio::sync::watch::error::RecvError> {
    match rx {
        Some(rx) => rx.changed().await,
        None => std::future::pending().await,
    }
}

fn render(event: &UiEvent) {
    match event {
        UiEvent::Connection(state) => info!("[link] {:?}", state),
        UiEvent::SessionStarted { session_id } => info!("[session] {}", session_id),
        UiEvent::Transcript { text, is_final } => {
            info!("[you{}] {}", if *is_final { "" } else { "…" }, text)
        }
        UiEvent::AssistantText {
            delta,
            is_final,
            full_text,
        } => match (is_final, full_text) {
            (true, Some(full)) => info!("[agent] {}", full),
            _ => debug!("[agent+] {}", delta),
        },
        UiEvent::Thinking { message } => info!("[thinking] {}", message),
        UiEvent::MemoryStored { memory_id, .. } => info!("[memory] stored {}", memory_id),
        UiEvent::Error { code, message } => warn!("[error] {:?} {}", code, message),
    }
}
