//! Load config from file, environment and command line.

use serde::Deserialize;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;

use peabak_core::{PeerId, Version, PROTOCOL_VERSION};

/// Peer configuration. File: $PEABAK_CONFIG, ~/.config/peabak/config.toml or /etc/peabak/config.toml.
/// Env overrides: PEABAK_PEER_ID, PEABAK_DATA_DIR, PEABAK_CONTROL, PEABAK_BACKUP, PEABAK_RESTORE,
/// PEABAK_CAPACITY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Numeric peer id, unique on the LAN (default 1).
    #[serde(default = "default_peer_id")]
    pub peer_id: PeerId,
    /// Protocol version written on outgoing messages (default "1.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Control channel: negotiation traffic.
    #[serde(default = "default_control")]
    pub control: SocketAddrV4,
    /// Data-backup channel: PUTCHUNK traffic.
    #[serde(default = "default_backup")]
    pub backup: SocketAddrV4,
    /// Data-restore channel: CHUNK traffic.
    #[serde(default = "default_restore")]
    pub restore: SocketAddrV4,
    /// Root for chunks, ledger snapshot and restored files; a per-peer subdirectory is used.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Bytes this peer lends to others (default 1 GiB).
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// Messages being handled at once before receive loops wait.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Protocol timers, all in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimingConfig {
    pub read_timeout_ms: u64,
    pub putchunk_base_ms: u64,
    pub putchunk_attempts: u32,
    pub getchunk_base_ms: u64,
    pub getchunk_attempts: u32,
    pub chunker_delay_ms: u64,
    pub chunker_jitter_ms: u64,
    pub removed_delay_min_ms: u64,
    pub removed_delay_max_ms: u64,
    pub stored_jitter_ms: u64,
    pub delete_repeats: u32,
    pub delete_spacing_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 500,
            putchunk_base_ms: 1000,
            putchunk_attempts: 5,
            getchunk_base_ms: 1000,
            getchunk_attempts: 5,
            chunker_delay_ms: 0,
            chunker_jitter_ms: 400,
            removed_delay_min_ms: 0,
            removed_delay_max_ms: 400,
            stored_jitter_ms: 400,
            delete_repeats: 3,
            delete_spacing_ms: 500,
        }
    }
}

/// Timers as durations, handed to the state machines.
#[derive(Debug, Clone)]
pub struct Timing {
    pub read_timeout: Duration,
    pub putchunk_base: Duration,
    pub putchunk_attempts: u32,
    pub getchunk_base: Duration,
    pub getchunk_attempts: u32,
    pub chunker_delay: Duration,
    pub chunker_jitter: Duration,
    pub removed_delay_min: Duration,
    pub removed_delay_max: Duration,
    pub stored_jitter: Duration,
    pub delete_repeats: u32,
    pub delete_spacing: Duration,
}

impl From<&TimingConfig> for Timing {
    fn from(t: &TimingConfig) -> Self {
        let ms = Duration::from_millis;
        Self {
            read_timeout: ms(t.read_timeout_ms.max(1)),
            putchunk_base: ms(t.putchunk_base_ms),
            putchunk_attempts: t.putchunk_attempts.max(1),
            getchunk_base: ms(t.getchunk_base_ms),
            getchunk_attempts: t.getchunk_attempts.max(1),
            chunker_delay: ms(t.chunker_delay_ms),
            chunker_jitter: ms(t.chunker_jitter_ms),
            removed_delay_min: ms(t.removed_delay_min_ms),
            removed_delay_max: ms(t.removed_delay_max_ms.max(t.removed_delay_min_ms)),
            stored_jitter: ms(t.stored_jitter_ms),
            delete_repeats: t.delete_repeats.max(1),
            delete_spacing: ms(t.delete_spacing_ms),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Timing::from(&TimingConfig::default())
    }
}

fn default_peer_id() -> PeerId {
    1
}
fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}
fn default_control() -> SocketAddrV4 {
    SocketAddrV4::new([239, 255, 61, 1].into(), 8801)
}
fn default_backup() -> SocketAddrV4 {
    SocketAddrV4::new([239, 255, 61, 2].into(), 8802)
}
fn default_restore() -> SocketAddrV4 {
    SocketAddrV4::new([239, 255, 61, 3].into(), 8803)
}
fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join(".local/share/peabak"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/peabak"))
}
fn default_capacity() -> u64 {
    1 << 30
}
fn default_worker_threads() -> usize {
    4
}
fn default_send_queue() -> usize {
    256
}
fn default_max_inflight() -> usize {
    64
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            version: default_version(),
            control: default_control(),
            backup: default_backup(),
            restore: default_restore(),
            data_dir: default_data_dir(),
            capacity: default_capacity(),
            worker_threads: default_worker_threads(),
            send_queue: default_send_queue(),
            max_inflight: default_max_inflight(),
            timing: TimingConfig::default(),
        }
    }
}

impl PeerConfig {
    /// Parsed protocol version; falls back to the built-in one if the configured string is invalid.
    pub fn protocol_version(&self) -> Version {
        self.version.parse().unwrap_or_else(|_| {
            tracing::warn!(version = %self.version, "invalid protocol version in config, using {}", PROTOCOL_VERSION);
            PROTOCOL_VERSION
        })
    }

    /// Directory owned by this peer under `data_dir`.
    pub fn peer_dir(&self) -> PathBuf {
        self.data_dir.join(format!("peer-{}", self.peer_id))
    }
}

/// Command-line options understood by the daemon.
#[derive(Debug, Default, PartialEq)]
pub struct Args {
    pub config: Option<PathBuf>,
    pub peer_id: Option<PeerId>,
    pub data_dir: Option<PathBuf>,
    pub version: bool,
}

/// Parse `--config <path>`, `--peer-id <n>`, `--data-dir <path>`, `--version`.
pub fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--config" | "-c" => {
                out.config = Some(it.next().ok_or_else(|| anyhow::anyhow!("--config needs a path"))?.into())
            }
            "--peer-id" | "-p" => {
                let v = it.next().ok_or_else(|| anyhow::anyhow!("--peer-id needs a number"))?;
                out.peer_id = Some(v.parse()?);
            }
            "--data-dir" | "-d" => {
                out.data_dir = Some(it.next().ok_or_else(|| anyhow::anyhow!("--data-dir needs a path"))?.into())
            }
            other => anyhow::bail!("unknown argument {:?}", other),
        }
    }
    Ok(out)
}

/// Load config: merge default, then config file (if present), then env vars, then command line.
pub fn load(args: &Args) -> PeerConfig {
    let mut c = load_file(args.config.clone()).unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    if let Some(id) = args.peer_id {
        c.peer_id = id;
    }
    if let Some(dir) = &args.data_dir {
        c.data_dir = dir.clone();
    }
    c
}

fn apply_env(c: &mut PeerConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("PEABAK_PEER_ID").and_then(|s| s.parse().ok()) {
        c.peer_id = p;
    }
    if let Some(d) = var("PEABAK_DATA_DIR") {
        c.data_dir = PathBuf::from(d);
    }
    if let Some(a) = var("PEABAK_CONTROL").and_then(|s| s.parse().ok()) {
        c.control = a;
    }
    if let Some(a) = var("PEABAK_BACKUP").and_then(|s| s.parse().ok()) {
        c.backup = a;
    }
    if let Some(a) = var("PEABAK_RESTORE").and_then(|s| s.parse().ok()) {
        c.restore = a;
    }
    if let Some(n) = var("PEABAK_CAPACITY").and_then(|s| s.parse().ok()) {
        c.capacity = n;
    }
}

fn config_paths(explicit: Option<PathBuf>) -> Vec<PathBuf> {
    if let Some(p) = explicit {
        return vec![p];
    }
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("PEABAK_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/peabak/config.toml"));
    }
    out.push(PathBuf::from("/etc/peabak/config.toml"));
    out
}

fn load_file(explicit: Option<PathBuf>) -> Option<PeerConfig> {
    for p in config_paths(explicit) {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<PeerConfig>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config file"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}
