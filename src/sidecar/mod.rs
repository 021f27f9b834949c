//! Supervision of the out-of-process overlay client.
//!
//! The NKN client runs as a Node child process speaking newline-delimited
//! JSON on its standard streams. We own its lifecycle: materialize the
//! bridge script, launch the child with the identity seed in its
//! environment, pump its output into an event queue, and serialize our
//! command writes behind a mutex. There is no restart policy; if the child
//! dies outside a requested shutdown, the whole process exits nonzero.

pub mod asset;
pub mod protocol;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as ProcessCommand};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::outbound::{CommandSink, OutboundMessage};
use crate::Result;

use self::protocol::{Command, Event};

/// The overlay address published by the sidecar. Written once by the
/// supervisor when the `ready` event arrives, read by everyone else.
pub type SharedAddr = Arc<RwLock<Option<String>>>;

/// Read the current overlay address, if the sidecar has connected yet.
pub fn read_addr(addr: &SharedAddr) -> Option<String> {
    addr.read().expect("sidecar addr lock poisoned").clone()
}

/// Handle to the running sidecar child.
pub struct Sidecar {
    stdin: Mutex<ChildStdin>,
    addr: SharedAddr,
    closing: AtomicBool,
}

impl Sidecar {
    /// Launch the sidecar and start pumping its output.
    ///
    /// Returns the supervisor handle plus the stream of parsed events for
    /// the dispatcher to consume.
    pub async fn start(
        config: &Config,
        seed: Option<String>,
    ) -> Result<(Arc<Sidecar>, mpsc::UnboundedReceiver<Event>)> {
        ensure_bridge_script(&config.sidecar_dir).await?;

        // The script is addressed by file name because the child's working
        // directory is the sidecar dir (where `node_modules` lives).
        let mut command = ProcessCommand::new("node");
        command
            .arg(asset::SIDECAR_FILE_NAME)
            .current_dir(&config.sidecar_dir)
            .env("NKN_IDENTIFIER", &config.nkn_identifier)
            .env("NKN_SEED", seed.unwrap_or_default())
            .env("NKN_SUBCLIENTS", config.nkn_subclients.to_string())
            .env(
                "NKN_RESPONSE_TIMEOUT_MS",
                config.nkn_response_timeout_ms.to_string(),
            )
            .env("NKN_MSG_HOLDING_S", config.nkn_msg_holding_s.to_string())
            .env(
                "NKN_WS_HEARTBEAT_MS",
                config.nkn_ws_heartbeat_ms.to_string(),
            )
            .env("NKN_SEED_RPC_ADDRS", config.nkn_seed_rpc_addrs.join(","))
            .env("NKN_SEED_WS_ADDRS", config.nkn_seed_ws_addrs.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !config.nkn_rpc_addrs.is_empty() {
            command.env("NKN_RPC_ADDRS", config.nkn_rpc_addrs.join(","));
        }

        let mut child = command
            .spawn()
            .context("could not launch the Node sidecar")?;
        let stdin = child
            .stdin
            .take()
            .context("sidecar child has no stdin pipe")?;
        let stdout = child
            .stdout
            .take()
            .context("sidecar child has no stdout pipe")?;
        let stderr = child
            .stderr
            .take()
            .context("sidecar child has no stderr pipe")?;

        let sidecar = Arc::new(Sidecar {
            stdin: Mutex::new(stdin),
            addr: Arc::new(RwLock::new(None)),
            closing: AtomicBool::new(false),
        });

        // Both output streams feed the same lenient parser; the sidecar
        // interleaves SDK noise with protocol lines and we treat them
        // as one merged stream.
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_lines(stdout, sidecar.clone(), tx.clone()));
        tokio::spawn(pump_lines(stderr, sidecar.clone(), tx));
        tokio::spawn(watch_child(child, sidecar.clone()));

        Ok((sidecar, rx))
    }

    /// A handle other components use to read the address without holding
    /// the whole supervisor.
    pub fn addr_handle(&self) -> SharedAddr {
        self.addr.clone()
    }

    fn set_addr(&self, addr: &str) {
        *self.addr.write().expect("sidecar addr lock poisoned") = Some(addr.to_owned());
    }

    /// Ask the sidecar to shut down; it closes its overlay client and
    /// exits on its own.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(err) = self.write_command(&Command::Close).await {
            warn!("could not send close to sidecar: {}", err);
        }
    }

    async fn write_command(&self, command: &Command) -> Result<()> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("could not write to sidecar stdin")?;
        stdin
            .flush()
            .await
            .context("could not flush sidecar stdin")?;
        Ok(())
    }
}

#[async_trait]
impl CommandSink for Sidecar {
    /// Write one `send` command. Called only by the sender task, but the
    /// stdin mutex also serializes the shutdown `close` against it.
    async fn send_now(&self, msg: &OutboundMessage) -> Result<()> {
        self.write_command(&Command::Send {
            id: msg.id.clone(),
            dest: msg.dest.clone(),
            payload_b64: msg.payload_b64.clone(),
        })
        .await
    }
}

/// Read one output stream line by line, forwarding parsed events.
async fn pump_lines<R>(
    stream: R,
    sidecar: Arc<Sidecar>,
    tx: mpsc::UnboundedSender<Event>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(event) = protocol::parse_event(&line) {
            if let Event::Ready { addr } = &event {
                sidecar.set_addr(addr);
                info!(addr = %addr, "NKN sidecar ready");
            }
            if tx.send(event).is_err() {
                break;
            }
        }
    }
}

/// Exit the process when the child dies outside a requested shutdown.
async fn watch_child(mut child: Child, sidecar: Arc<Sidecar>) {
    let status = child.wait().await;
    if sidecar.closing.load(Ordering::SeqCst) {
        info!("sidecar exited after close");
        return;
    }
    match status {
        Ok(status) => error!("sidecar exited unexpectedly: {}", status),
        Err(err) => error!("could not wait for sidecar: {}", err),
    }
    std::process::exit(1);
}

/// Write the bridge script into `dir` if it is not already there. An
/// existing file is left untouched so local modifications survive.
pub async fn ensure_bridge_script(dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("could not create sidecar dir {:?}", dir))?;
    let script = dir.join(asset::SIDECAR_FILE_NAME);
    if tokio::fs::try_exists(&script).await.unwrap_or(false) {
        return Ok(script);
    }
    tokio::fs::write(&script, asset::SIDECAR_SOURCE)
        .await
        .with_context(|| format!("could not write {:?}", script))?;
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bridge_script_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let script = ensure_bridge_script(dir.path()).await.unwrap();
        let written = tokio::fs::read_to_string(&script).await.unwrap();
        assert!(written.contains("MultiClient"));

        // A second call must not clobber local edits.
        tokio::fs::write(&script, "// patched").await.unwrap();
        ensure_bridge_script(dir.path()).await.unwrap();
        let kept = tokio::fs::read_to_string(&script).await.unwrap();
        assert_eq!(kept, "// patched");
    }
}
