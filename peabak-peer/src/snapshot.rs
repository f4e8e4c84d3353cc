//! Ledger persistence: one bincode file, written on shutdown, read on startup.

use std::path::Path;

use anyhow::Context as _;
use peabak_core::{Ledger, LedgerSnapshot};

/// Ledger stored at `path`. Missing or unreadable snapshots give an empty ledger.
pub fn load(path: &Path) -> Ledger {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no ledger snapshot, starting empty");
            return Ledger::new();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read ledger snapshot, starting empty");
            return Ledger::new();
        }
    };
    match LedgerSnapshot::from_bytes(&bytes) {
        Ok(s) => {
            tracing::info!(own = s.own.len(), other = s.other.len(), "ledger snapshot loaded");
            Ledger::from_snapshot(s)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt ledger snapshot, starting empty");
            Ledger::new()
        }
    }
}

/// Write the ledger atomically (temp file, then rename).
pub fn save(ledger: &Ledger, path: &Path) -> anyhow::Result<()> {
    let bytes = ledger.snapshot().to_bytes().context("encode ledger snapshot")?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}
