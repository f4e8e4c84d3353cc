// PeaBak peer: multicast backup daemon with a stdin command console.

mod channel;
mod chunker;
mod config;
mod console;
mod context;
mod dispatch;
mod files;
mod getchunker;
mod lifecycle;
mod peer;
mod putchunker;
mod removed;
mod restorer;
mod snapshot;
#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use peabak_core::Ledger;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use crate::channel::Groups;
use crate::config::{PeerConfig, Timing};
use crate::context::Context;
use crate::dispatch::{ChannelKind, Dispatcher};
use crate::files::{DirFileSink, DiskChunkStore};
use crate::peer::Peer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = config::parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("peabak-peer {}", VERSION);
        return Ok(());
    }
    let cfg = config::load(&args);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.worker_threads.max(1))
        .enable_all()
        .build()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: PeerConfig) -> anyhow::Result<()> {
    let dir = cfg.peer_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let snapshot_path = dir.join("ledger.bin");

    let ledger = Arc::new(snapshot::load(&snapshot_path));
    let store = DiskChunkStore::open(dir.join("chunks")).context("open chunk store")?;
    let timing = Timing::from(&cfg.timing);
    let (dispatcher, outbound) = Dispatcher::new(cfg.send_queue);
    let ctx = Arc::new(Context {
        peer_id: cfg.peer_id,
        version: cfg.protocol_version(),
        ledger: ledger.clone(),
        store: Arc::new(store),
        sink: Arc::new(DirFileSink::new(dir.join("restored"))),
        dispatcher,
        timing: timing.clone(),
    });
    let peer = Arc::new(Peer::new(ctx, cfg.capacity));
    peer.reassert_stored_claims();

    let groups = Groups::from(&cfg);
    let stop = Arc::new(AtomicBool::new(false));
    let inflight = Arc::new(Semaphore::new(cfg.max_inflight.max(1)));
    let mut receivers = Vec::new();
    for kind in ChannelKind::ALL {
        let group = groups.addr(kind);
        let socket = channel::bind_group(group)
            .with_context(|| format!("join {} group {}", kind.name(), group))?;
        receivers.push(tokio::spawn(channel::run_receiver(
            kind,
            socket,
            peer.clone(),
            stop.clone(),
            timing.read_timeout,
            inflight.clone(),
        )));
    }
    let sender = channel::sender_socket().context("open sender socket")?;
    let sender_task = tokio::spawn(channel::run_sender(outbound, sender, groups));
    tracing::info!(
        peer_id = cfg.peer_id,
        version = %cfg.protocol_version(),
        data_dir = %dir.display(),
        "peer started"
    );

    let served = tokio::select! {
        r = shutdown_signal() => r,
        _ = console::run(peer.clone()) => Ok(()),
    };

    stop.store(true, Ordering::Relaxed);
    for r in receivers {
        let _ = r.await;
    }
    sender_task.abort();
    checkpoint_and_exit(served, &ledger, &snapshot_path)
}

/// Save the ledger whatever ended the run, then report the first error.
fn checkpoint_and_exit(served: anyhow::Result<()>, ledger: &Ledger, path: &Path) -> anyhow::Result<()> {
    if let Err(e) = &served {
        tracing::error!(error = %e, "stopping after error");
    }
    let saved = snapshot::save(ledger, path).context("save ledger snapshot");
    served?;
    saved?;
    tracing::info!("peer stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
