mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use call_signaling::telemetry::{self, LogConfig};
use call_signaling::{CallAgent, CallConfig, CallEvent, CallHandle, CallPhase, StaticDirectory};
use clap::Parser;
use media_webrtc::{NullSink, SilenceCapture, WebRtcEngine};
use relay_bus::LocalRelay;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&LogConfig {
        level: cli.log_level(),
        ansi: std::io::IsTerminal::is_terminal(&std::io::stderr()),
    })?;

    let config = if cli.stun {
        CallConfig::from_env()
    } else {
        CallConfig {
            ice_servers: Vec::new(),
            ..CallConfig::from_env()
        }
    };

    match cli.command {
        Commands::Loopback {
            caller,
            callee,
            hangup_after_secs,
            decline,
        } => {
            run_loopback(
                config,
                &caller,
                &callee,
                Duration::from_secs(hangup_after_secs),
                decline,
            )
            .await
        }
    }
}

fn spawn_agent(
    id: &str,
    relay: &Arc<LocalRelay>,
    directory: &Arc<StaticDirectory>,
    config: &CallConfig,
) -> Result<CallHandle> {
    let engine = WebRtcEngine::new(Arc::new(SilenceCapture), Arc::new(NullSink))
        .with_context(|| format!("building media engine for {id}"))?;
    Ok(CallAgent::spawn(
        id,
        relay.clone(),
        Arc::new(engine),
        directory.clone(),
        config.clone(),
    ))
}

/// Logs everything an agent reports until its event stream closes.
fn log_events(handle: &CallHandle) {
    let me = handle.self_id().clone();
    let mut events = handle.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::PhaseChanged(phase)) => info!(agent = %me, %phase, "phase"),
                Ok(event) => info!(agent = %me, ?event, "event"),
                Err(RecvError::Lagged(skipped)) => warn!(agent = %me, skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn run_loopback(
    config: CallConfig,
    caller_id: &str,
    callee_id: &str,
    hold_for: Duration,
    decline: bool,
) -> Result<()> {
    anyhow::ensure!(caller_id != callee_id, "caller and callee must differ");
    let relay = Arc::new(LocalRelay::new());
    let directory = Arc::new(StaticDirectory::with_online([caller_id, callee_id]));

    let caller = spawn_agent(caller_id, &relay, &directory, &config)?;
    let callee = spawn_agent(callee_id, &relay, &directory, &config)?;
    log_events(&caller);
    log_events(&callee);

    caller.open_chat(callee_id).await.context("caller opens chat")?;
    callee.open_chat(caller_id).await.context("callee opens chat")?;

    caller.input_changed().await.context("typing notice")?;
    caller.start_call().await.context("placing call")?;
    callee.wait_for_phase(CallPhase::Ringing).await?;

    if decline {
        callee.decline_call().await.context("declining")?;
        caller.wait_for_phase(CallPhase::Idle).await?;
        info!("call declined");
    } else {
        callee.accept_call().await.context("answering")?;
        caller.wait_for_phase(CallPhase::Active).await?;
        info!(seconds = hold_for.as_secs(), "call active");

        let local = caller.local_volume();
        let remote = caller.remote_volume();
        let metering = tokio::spawn(async move {
            let mut report = tokio::time::interval(Duration::from_secs(1));
            loop {
                report.tick().await;
                info!(local = local.latest(), remote = remote.latest(), "caller volume");
            }
        });

        tokio::select! {
            _ = tokio::time::sleep(hold_for) => {}
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }
        metering.abort();
        caller.end_call().await.context("hanging up")?;
        callee.wait_for_phase(CallPhase::Idle).await?;
        info!("call ended");
    }

    caller.shutdown().await;
    callee.shutdown().await;
    Ok(())
}
