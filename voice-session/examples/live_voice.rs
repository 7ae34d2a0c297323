//! Live voice conversation with chart rendering.
//!
//! Streams the default microphone to a realtime voice service, plays the
//! spoken reply on the default speaker and prints every chart the model asks
//! to render.
//!
//! # Usage
//!
//! ```bash
//! export LIVE_ENDPOINT="wss://example.com/v1/live"
//! export LIVE_API_KEY="your-api-key"
//! cargo run --example live_voice --features desktop-audio
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use voice_session::device::{CpalInput, CpalOutput};
use voice_session::tools::{RENDER_TOOL, RenderTool, render_declaration};
use voice_session::transport::WebSocketConnector;
use voice_session::{
    CaptureConfig, CaptureEngine, DispatcherConfig, EventKind, PlaybackConfig, PlaybackEngine,
    SessionClient, SessionConfig, SessionEvent, ToolCallDispatcher,
};

const GREETING: &str = "Hello! Please introduce yourself briefly.";

async fn run(endpoint: &str, api_key: &str) -> anyhow::Result<()> {
    let connector = WebSocketConnector::new(endpoint)?.with_bearer_token(api_key);
    let session = SessionClient::new(Arc::new(connector));

    let playback = PlaybackEngine::new(&session, PlaybackConfig::default())?;
    let capture = CaptureEngine::new(&session, CaptureConfig::default())?;
    let dispatcher = ToolCallDispatcher::new(&session, DispatcherConfig::default());
    let (render, mut charts) = RenderTool::channel(8);
    dispatcher.register(RENDER_TOOL, render);

    tokio::spawn(async move {
        while let Some(chart) = charts.recv().await {
            println!("\n[chart] {chart}");
        }
    });

    {
        let weak = session.downgrade();
        session.on(EventKind::Ready, move |_| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                if let Err(e) = session.send_text(GREETING).await {
                    warn!(error = %e, "Could not send greeting");
                }
            });
        });
    }
    session.on(EventKind::StateChanged, |event| {
        if let SessionEvent::StateChanged { from, to } = event {
            info!(%from, %to, "Session state changed");
        }
    });
    session.on(EventKind::TextDelta, |event| {
        if let SessionEvent::TextDelta(text) = event {
            print!("{text}");
        }
    });
    session.on(EventKind::Error, |event| {
        if let SessionEvent::Error { kind, message } = event {
            warn!(?kind, %message, "Session error");
        }
    });

    let config = SessionConfig::builder()
        .instruction("You are a friendly assistant. Respond naturally and concisely.")
        .tool(render_declaration())
        .build()?;

    info!(endpoint, "Connecting...");
    session.connect(config).await?;
    info!(session_id = ?session.session_id(), "Connected");

    playback.start(&CpalOutput::new())?;
    capture.start(&CpalInput::new())?;
    info!("Listening. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    capture.stop().await;
    playback.stop().await;
    session.disconnect().await?;

    let stats = session.stats();
    info!(
        frames_sent = stats.frames_sent,
        frames_dropped = stats.frames_dropped,
        frames_received = stats.frames_received,
        "Session closed"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (Ok(endpoint), Ok(api_key)) = (std::env::var("LIVE_ENDPOINT"), std::env::var("LIVE_API_KEY")) else {
        error!("LIVE_ENDPOINT and LIVE_API_KEY must be set");
        return ExitCode::FAILURE;
    };

    match run(&endpoint, &api_key).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Live voice session failed");
            ExitCode::FAILURE
        }
    }
}
