//! # gage
//!
//! Headless call client. Connects one user to a group's call signaling,
//! optionally starts or answers a call, and logs every state change until
//! interrupted. Media is synthetic; the point is exercising signaling and
//! the SFU control plane end to end.

use clap::{Parser, ValueEnum};
use gage_call::sfu::HttpSfuControl;
use gage_call::signaling::{CloseReason, TungsteniteConnector};
use gage_call::synthetic::{SyntheticDevices, SyntheticEngine};
use gage_call::{
    CallBackends, CallController, CallKind, CallState, ConnectionKey, ConnectionManager,
    ConnectionStatus,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Audio,
    Video,
}

impl From<Kind> for CallKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Audio => CallKind::Audio,
            Kind::Video => CallKind::Video,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "gage", version, about = "Join a gage group call from the terminal")]
struct Args {
    /// Chat group whose call to join.
    #[arg(long, env = "GAGE_GROUP")]
    group: String,

    /// Username to appear as.
    #[arg(long, env = "GAGE_USER")]
    user: String,

    /// Overrides `signaling.url`.
    #[arg(long)]
    signaling_url: Option<String>,

    /// Overrides `sfu.base_url`.
    #[arg(long)]
    sfu_url: Option<String>,

    /// Start a group call once connected.
    #[arg(long, value_enum, conflicts_with = "call")]
    start: Option<Kind>,

    /// Ring one group member instead of the whole group.
    #[arg(long, value_name = "USER")]
    call: Option<String>,

    /// Kind used with `--call`.
    #[arg(long, value_enum, default_value = "audio")]
    kind: Kind,

    /// Accept incoming calls automatically.
    #[arg(long)]
    answer: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = gage_common::config::init()?;

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gage_call=debug,gage_client=info".into());
    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }

    tracing::info!("Starting gage v{}", env!("CARGO_PKG_VERSION"));

    let mut signaling = config.signaling.clone();
    if let Some(url) = &args.signaling_url {
        signaling.url = url.clone();
    }
    let mut sfu_config = config.sfu.clone();
    if let Some(url) = &args.sfu_url {
        sfu_config.base_url = url.clone();
    }

    // === Signaling ===
    let manager = ConnectionManager::new(
        Arc::new(TungsteniteConnector),
        signaling,
        config.health.clone(),
    );
    let key = ConnectionKey::new(args.group.clone(), args.user.clone());
    let handle = manager.open(key.clone()).await;
    tracing::info!(%key, instance = handle.instance_id(), "Signaling channel opened");

    // === Call core ===
    let sfu = HttpSfuControl::new(&sfu_config, args.group.clone(), args.user.clone())?;
    let controller = CallController::new(
        handle.clone(),
        CallBackends {
            devices: Arc::new(SyntheticDevices::new()),
            sfu: Arc::new(sfu),
            engine: Arc::new(SyntheticEngine::new()),
        },
        config.call.clone(),
    );

    if args.start.is_some() || args.call.is_some() {
        let mut status = handle.watch_status();
        tokio::time::timeout(
            Duration::from_secs(30),
            status.wait_for(|s| s.status == ConnectionStatus::Connected),
        )
        .await
        .map_err(|_| anyhow::anyhow!("signaling did not connect within 30s"))??;

        if let Some(kind) = args.start {
            controller.start_call(kind.into()).await?;
        } else if let Some(target) = &args.call {
            controller.start_individual_call(target, args.kind.into()).await?;
        }
    }

    run(&controller, args.answer).await;

    match controller.hang_up().await {
        Ok(report) => tracing::info!(?report, "Call resources released"),
        Err(e) => tracing::warn!("Failed to leave call cleanly: {e}"),
    }
    manager.close_all(CloseReason::Manual).await;
    tracing::info!("Goodbye");
    Ok(())
}

/// Log snapshots until Ctrl-C.
async fn run(controller: &CallController, answer: bool) {
    let mut snapshots = controller.subscribe();
    let mut last_state = CallState::Idle;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.state != last_state {
                    tracing::info!(
                        from = %last_state,
                        to = %snapshot.state,
                        caller = snapshot.caller.as_deref().unwrap_or("-"),
                        "Call state changed"
                    );
                    last_state = snapshot.state;
                }
                if let Some(error) = &snapshot.last_error {
                    tracing::warn!("{error}");
                }
                match serde_json::to_string(&snapshot) {
                    Ok(json) => tracing::debug!(snapshot = %json, "Call snapshot"),
                    Err(e) => tracing::debug!("Snapshot not serializable: {e}"),
                }

                if answer && snapshot.state == CallState::Ringing {
                    if let Err(e) = controller.accept().await {
                        tracing::warn!("Auto-answer failed: {e}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, hanging up");
                break;
            }
        }
    }
}
