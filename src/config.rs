//! Environment-driven configuration.
//!
//! Everything is an environment variable (usually loaded from `.env`), with
//! the same names, defaults and clamps the deployment scripts already use.

use std::env;
use std::num::NonZeroU32;
use std::path::PathBuf;

use anyhow::Context;

use crate::Result;

/// Default NKN mainnet seed RPC endpoints, used when `NKN_SEED_RPC_ADDRS`
/// is not set.
pub const DEFAULT_SEED_RPC: &[&str] = &[
    "https://mainnet-seed-0001.nkn.org/mainnet/api/wallet",
    "https://mainnet-seed-0002.nkn.org/mainnet/api/wallet",
    "https://mainnet-seed-0003.nkn.org/mainnet/api/wallet",
];

/// Default NKN mainnet seed WebSocket endpoints.
pub const DEFAULT_SEED_WS: &[&str] = &[
    "wss://mainnet-seed-0001.nkn.org/mainnet/ws",
    "wss://mainnet-seed-0002.nkn.org/mainnet/ws",
    "wss://mainnet-seed-0003.nkn.org/mainnet/ws",
];

/// Runtime configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP surface to.
    pub forward_bind: String,
    /// Preferred HTTP port. The first free port in a 100-port range starting
    /// here is used.
    pub forward_port: u16,
    /// Keep a loopback bind instead of promoting it to `0.0.0.0`.
    pub forward_force_local: bool,
    /// Concurrent upstream elevation calls, clamped to `[1, 4]`.
    pub forward_concurrency: usize,
    /// Rate-limit refill, requests per second per client IP, clamped to
    /// `[1, 6]`.
    pub forward_rate_rps: NonZeroU32,
    /// Rate-limit burst per client IP, clamped to `[1, 12]`.
    pub forward_rate_burst: NonZeroU32,

    /// Base URL of the local elevation service, trailing slash stripped.
    pub elev_base: String,
    /// Default dataset when a query names none.
    pub elev_dataset: String,
    /// Upstream HTTP timeout in milliseconds.
    pub elev_timeout_ms: u64,

    /// NKN client identifier (the part before the dot in our address).
    pub nkn_identifier: String,
    /// Explicit seed from the environment; empty means "use the seed file".
    pub nkn_seed: String,
    /// Where the generated seed is persisted.
    pub nkn_seed_file: PathBuf,
    /// Directory holding the sidecar script and its node_modules.
    pub sidecar_dir: PathBuf,
    /// NKN MultiClient sub-clients, clamped to `[1, 4]`.
    pub nkn_subclients: u32,
    /// Comma-separated RPC node addresses to pin, if any.
    pub nkn_rpc_addrs: Vec<String>,
    /// Seed RPC endpoints passed through to the sidecar.
    pub nkn_seed_rpc_addrs: Vec<String>,
    /// Seed WebSocket endpoints passed through to the sidecar.
    pub nkn_seed_ws_addrs: Vec<String>,
    /// Sidecar response timeout in milliseconds, at least 5000.
    pub nkn_response_timeout_ms: u64,
    /// Store-and-forward holding time in seconds, at least 30.
    pub nkn_msg_holding_s: u64,
    /// Sidecar WebSocket heartbeat timeout in milliseconds, at least 30000.
    pub nkn_ws_heartbeat_ms: u64,
    /// Pacing delay between consecutive DM sends, milliseconds.
    pub nkn_send_delay_ms: u64,
    /// Outbound send queue capacity, at least 32.
    pub nkn_send_queue_max: usize,
    /// Ceiling on DM reply chunk size in bytes; 0 disables chunking.
    pub dm_chunk_limit_bytes: usize,
}

impl Config {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Config> {
        let forward_rate_rps = clamped_u32("FORWARD_RATE_RPS", 6, 1, 6)?;
        let forward_rate_burst = clamped_u32("FORWARD_RATE_BURST", 12, 1, 12)?;
        Ok(Config {
            forward_bind: string_var("FORWARD_BIND", "0.0.0.0"),
            forward_port: parsed_var("FORWARD_PORT", 9011)?,
            forward_force_local: env::var("FORWARD_FORCE_LOCAL")
                .map(|v| v == "1")
                .unwrap_or(false),
            forward_concurrency: clamped_u32("FORWARD_CONCURRENCY", 4, 1, 4)?.get()
                as usize,
            forward_rate_rps,
            forward_rate_burst,

            elev_base: string_var("ELEV_BASE", "http://localhost:5000")
                .trim_end_matches('/')
                .to_owned(),
            elev_dataset: string_var("ELEV_DATASET", "mapzen"),
            elev_timeout_ms: parsed_var("ELEV_TIMEOUT_MS", 10_000)?,

            nkn_identifier: string_var("NKN_IDENTIFIER", "forwarder"),
            nkn_seed: string_var("NKN_SEED", "").trim().to_owned(),
            nkn_seed_file: PathBuf::from(string_var(
                "NKN_SEED_FILE",
                "sidecar/nkn.seed",
            )),
            sidecar_dir: PathBuf::from(string_var("NKN_SIDECAR_DIR", "sidecar")),
            nkn_subclients: clamped_u32("NKN_SUBCLIENTS", 2, 1, 4)?.get(),
            nkn_rpc_addrs: list_var("NKN_RPC_ADDRS"),
            nkn_seed_rpc_addrs: list_var_or("NKN_SEED_RPC_ADDRS", DEFAULT_SEED_RPC),
            nkn_seed_ws_addrs: list_var_or("NKN_SEED_WS_ADDRS", DEFAULT_SEED_WS),
            nkn_response_timeout_ms: parsed_var::<u64>("NKN_RESPONSE_TIMEOUT_MS", 20_000)?
                .max(5_000),
            nkn_msg_holding_s: parsed_var::<u64>("NKN_MSG_HOLDING_S", 90)?.max(30),
            nkn_ws_heartbeat_ms: parsed_var::<u64>("NKN_WS_HEARTBEAT_MS", 120_000)?
                .max(30_000),
            nkn_send_delay_ms: parsed_var("NKN_SEND_DELAY_MS", 250)?,
            nkn_send_queue_max: parsed_var::<usize>("NKN_SEND_QUEUE_MAX", 256)?.max(32),
            dm_chunk_limit_bytes: parsed_var("DM_CHUNK_LIMIT_BYTES", 1_024)?,
        })
    }
}

/// Read a string variable with a default. Empty values take the default.
fn string_var(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_owned(),
    }
}

/// Read and parse a variable with a default.
fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .with_context(|| format!("could not parse {}={:?}", name, v)),
        _ => Ok(default),
    }
}

/// Read a numeric variable and clamp it into `[lo, hi]` (`lo >= 1`).
fn clamped_u32(name: &str, default: u32, lo: u32, hi: u32) -> Result<NonZeroU32> {
    let raw = parsed_var(name, default)?;
    let clamped = raw.clamp(lo, hi);
    NonZeroU32::new(clamped)
        .with_context(|| format!("{} clamps to zero, which should be impossible", name))
}

/// Read a comma-separated list variable; empty entries are discarded.
fn list_var(name: &str) -> Vec<String> {
    env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Like [`list_var`], but falling back to a default list when unset or empty.
fn list_var_or(name: &str, default: &[&str]) -> Vec<String> {
    let parsed = list_var(name);
    if parsed.is_empty() {
        default.iter().map(|s| (*s).to_owned()).collect()
    } else {
        parsed
    }
}
