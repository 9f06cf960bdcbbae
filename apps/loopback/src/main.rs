//! beamdrop loopback runner.
//!
//! Wires a host and a guest endpoint over the in-memory transport, sends one
//! file from host to guest and verifies the received bytes.

mod args;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use beamdrop_logbook::{Logbook, init_tracing};
use beamdrop_protocol::TransferStatus;
use beamdrop_session::loopback::{LoopbackNetwork, LoopbackSignaling};
use beamdrop_session::{IceServerProvider, SessionCoordinator, SessionEvent};
use beamdrop_snapshot::{JsonDirBackend, SnapshotStore};
use beamdrop_transfer::{
    OutgoingFile, TransferEngine, TransferEvent, calculate_file_checksum, checksum_bytes,
};

use args::Args;
use config::AppConfig;

/// Upper bound on how long the run may take end to end.
const RUN_TIMEOUT: Duration = Duration::from_secs(300);

type Endpoint = SessionCoordinator<LoopbackSignaling>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (mut config, fallback) = AppConfig::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args);

    let logbook = Logbook::default();
    init_tracing(logbook.clone(), &config.log_filter)?;
    if let Some(fallback) = &fallback {
        fallback.log();
    }

    let ice = config.ice_servers.ice_servers().await?;
    debug!(count = ice.len(), "ice servers configured (unused by loopback)");

    let net = LoopbackNetwork::new();
    let host = endpoint(&net, &config, false).await;
    let guest = endpoint(&net, &config, true).await;
    info!(
        storage = %guest.engine().capabilities().environment_label,
        "guest storage selected"
    );

    let autosave = match config.state_dir() {
        Some(dir) => {
            let backend = JsonDirBackend::new(dir);
            info!(dir = %backend.dir().display(), "session snapshots enabled");
            let store = Arc::new(SnapshotStore::new(Arc::new(backend)));
            store.restore(&guest, &logbook).await?;
            let cancel = CancellationToken::new();
            let task = Arc::clone(&store).autosave(
                guest.clone(),
                logbook.clone(),
                config.autosave_debounce(),
                cancel.clone(),
            );
            Some((cancel, task))
        }
        None => None,
    };

    let outcome = tokio::time::timeout(RUN_TIMEOUT, run(&host, &guest, &config, &args))
        .await
        .context("run timed out");

    guest.disconnect().await;
    host.disconnect().await;
    if let Some((cancel, task)) = autosave {
        cancel.cancel();
        task.await?;
    }

    if args.dump_logs {
        println!("{}", serde_json::to_string_pretty(&logbook.entries())?);
    }
    outcome?
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(room) = &args.room {
        config.room_code = room.clone();
    }
    if let Some(root) = &args.storage_root {
        config.storage_root = Some(root.clone());
    }
    if let Some(dir) = &args.state_dir {
        config.state_dir = Some(dir.clone());
    }
    if let Some(size) = args.chunk_size {
        config.chunk_size = size;
    }
}

/// Only the receiving side gets a storage root; the sender never writes.
async fn endpoint(net: &LoopbackNetwork, config: &AppConfig, receiving: bool) -> Endpoint {
    let mut engine_config = config.engine_config();
    if !receiving {
        engine_config.storage_root = None;
    }
    let engine = Arc::new(TransferEngine::new(engine_config).await);
    SessionCoordinator::new(Arc::new(net.endpoint()), engine, config.session_config())
}

async fn run(
    host: &Endpoint,
    guest: &Endpoint,
    config: &AppConfig,
    args: &Args,
) -> anyhow::Result<()> {
    let mut host_events = host.subscribe();
    host.open(Some(&config.room_code)).await?;
    let guest_id = guest.open(None).await?;
    guest.connect(&config.room_code).await?;
    wait_for_peer(&mut host_events).await?;
    info!(room = %config.room_code, guest = %guest_id, "endpoints connected");

    let (file, expected) = outgoing(args).await?;
    let mut events = guest.engine().subscribe();
    let id = host.send_file(file).await?;

    let status = wait_for_terminal(&mut events, &id).await?;
    if status != TransferStatus::Completed {
        bail!("transfer {id} ended as {status:?}");
    }

    let received = guest.engine().read_file(&id).await?;
    let actual = checksum_bytes(&received);
    if actual != expected {
        bail!("checksum mismatch: sent {expected}, received {actual}");
    }
    info!(transfer = %id, bytes = received.len(), checksum = %actual, "transfer verified");
    println!("{id} {} bytes sha256:{actual}", received.len());
    Ok(())
}

/// Builds the payload and its expected checksum.
async fn outgoing(args: &Args) -> anyhow::Result<(OutgoingFile, String)> {
    match &args.file {
        Some(path) => {
            let owned = path.clone();
            let checksum = tokio::task::spawn_blocking(move || calculate_file_checksum(&owned))
                .await?
                .with_context(|| format!("hashing {}", path.display()))?;
            Ok((OutgoingFile::from_path(path), checksum))
        }
        None => {
            let data = generated(args.size);
            let checksum = checksum_bytes(&data);
            Ok((OutgoingFile::from_bytes("generated.bin", data), checksum))
        }
    }
}

/// Deterministic, non-repeating-looking filler (xorshift).
fn generated(size: u64) -> Vec<u8> {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    (0..size)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// The host attaches the inbound channel on its own task.
async fn wait_for_peer(events: &mut broadcast::Receiver<SessionEvent>) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::PeerConnected(_)) => return Ok(()),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => bail!("session events closed"),
        }
    }
}

async fn wait_for_terminal(
    events: &mut broadcast::Receiver<TransferEvent>,
    id: &str,
) -> anyhow::Result<TransferStatus> {
    loop {
        match events.recv().await {
            Ok(TransferEvent::StatusChanged {
                id: changed,
                status,
                ..
            }) if changed == id && status.is_terminal() => return Ok(status),
            Ok(TransferEvent::Progress { id: changed, progress }) if changed == id => {
                debug!(transfer = %id, progress = format_args!("{progress:.1}"), "receiving");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "progress events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => bail!("transfer events closed"),
        }
    }
}
