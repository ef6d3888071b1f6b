//! Process management for the wa-bridge subprocess.
//!
//! Spawns the bridge binary and talks to it in JSON lines over stdio.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::client::{BridgeClient, PendingRequests};
use super::protocol::{BridgeCommand, BridgeEvent};

/// Name of the bridge binary and of its session database
const BRIDGE_BINARY: &str = "wa-bridge";
pub const SESSION_DB: &str = "session.db";

pub struct BridgeProcess {
    child: Child,
    client: BridgeClient,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub binary_path: PathBuf,
    /// Session database and downloaded media live here
    pub data_dir: PathBuf,
    pub verbose: bool,
}

impl BridgeProcess {
    /// Spawn the bridge and start the stdout, stderr and stdin pumps.
    ///
    /// Replies to requests go to their waiters; everything else is
    /// forwarded to `event_tx` in arrival order. The event channel is
    /// unbounded: a full queue must never hold up the reply a handler is
    /// waiting for.
    pub async fn spawn(
        config: BridgeConfig,
        event_tx: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .context("Failed to create data directory")?;

        let mut cmd = Command::new(&config.binary_path);
        cmd.arg("--data-dir")
            .arg(&config.data_dir)
            .arg("--session-db")
            .arg(config.data_dir.join(SESSION_DB))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if config.verbose {
            cmd.arg("--verbose");
        }

        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to spawn wa-bridge binary at {:?}", config.binary_path)
        })?;

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;
        let stdin = child.stdin.take().context("Failed to capture stdin")?;

        let (command_tx, command_rx) = mpsc::channel::<BridgeCommand>(32);
        let pending = Arc::new(PendingRequests::new());

        let replies = pending.clone();
        tokio::spawn(async move {
            Self::read_events(stdout, event_tx, replies).await;
        });
        tokio::spawn(Self::read_stderr(stderr));
        tokio::spawn(Self::write_commands(stdin, command_rx));

        Ok(Self {
            child,
            client: BridgeClient::new(command_tx, pending),
        })
    }

    async fn read_events(
        stdout: ChildStdout,
        event_tx: mpsc::UnboundedSender<BridgeEvent>,
        pending: Arc<PendingRequests>,
    ) {
        let mut lines = BufReader::new(stdout).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }

            let event = match serde_json::from_str::<BridgeEvent>(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Failed to parse bridge event: {} - line: {}", e, truncate(&line, 200));
                    continue;
                }
            };

            if event.request_id().is_some() {
                if let Some(stray) = pending.complete(event).await {
                    debug!("Dropping reply nobody is waiting for: {:?}", stray.request_id());
                }
                continue;
            }

            if event_tx.send(event).is_err() {
                break;
            }
        }
        debug!("Bridge stdout closed");
        pending.fail_all().await;
    }

    async fn read_stderr(stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                debug!("[bridge] {}", line);
            }
        }
    }

    async fn write_commands(mut stdin: ChildStdin, mut command_rx: mpsc::Receiver<BridgeCommand>) {
        while let Some(cmd) = command_rx.recv().await {
            let mut json = match serde_json::to_string(&cmd) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize command: {}", e);
                    continue;
                }
            };
            json.push('\n');

            if let Err(e) = stdin.write_all(json.as_bytes()).await {
                error!("Failed to write command to bridge: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }
    }

    /// Handle shared with the event loop and the web API
    pub fn client(&self) -> BridgeClient {
        self.client.clone()
    }

    /// Ask the bridge to disconnect, killing it if it does not exit in time
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.client.send_command(BridgeCommand::Disconnect).await;

        tokio::select! {
            result = self.child.wait() => {
                result.context("Failed to wait for bridge process")?;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                self.child.kill().await.context("Failed to kill bridge process")?;
            }
        }

        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Locate the wa-bridge binary: next to our executable, in the working
/// directory, or in a cargo target directory.
pub fn find_bridge_binary() -> Result<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(exe_path) = std::env::current_exe() {
        let dir = exe_path.parent().unwrap_or(Path::new("."));
        candidates.push(dir.join(BRIDGE_BINARY));
    }
    candidates.push(PathBuf::from(".").join(BRIDGE_BINARY));
    for profile in ["debug", "release"] {
        candidates.push(PathBuf::from("target").join(profile).join(BRIDGE_BINARY));
    }

    candidates
        .into_iter()
        .find(|p| p.exists())
        .with_context(|| {
            format!(
                "Could not find the {BRIDGE_BINARY} binary. Put it next to this executable \
                 or pass --bridge-path."
            )
        })
}

/// Default directory for the databases and downloaded media
pub fn default_data_dir() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .or_else(dirs::home_dir)
        .context("Could not determine home directory")?
        .join("whatsapp-history");

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 200), "short");
    }

    /// Shell stand-in for wa-bridge: answers one command after `body` runs
    #[cfg(unix)]
    fn fake_bridge(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\nread -r cmd\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replies_bypass_undrained_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = |binary_path| BridgeConfig {
            binary_path,
            data_dir: dir.path().join("data"),
            verbose: false,
        };

        // Far more events than any bounded queue would hold, then the reply
        let chatty = fake_bridge(
            dir.path(),
            "chatty",
            r#"i=0
while [ "$i" -lt 500 ]; do
  echo '{"type":"log","level":"debug","message":"backlog"}'
  i=$((i + 1))
done
echo '{"type":"group_info","request_id":1,"name":"Hiking"}'
sleep 5"#,
        );
        let (tx, _events) = mpsc::unbounded_channel();
        let bridge = BridgeProcess::spawn(config(chatty), tx).await.unwrap();
        let name = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            bridge.client().group_name("120363@g.us"),
        )
        .await
        .expect("reply stuck behind queued events")
        .unwrap();
        assert_eq!(name.as_deref(), Some("Hiking"));
        drop(bridge);

        // A bridge that exits without answering fails the request at once
        let silent = fake_bridge(dir.path(), "silent", "exit 0");
        let (tx, _events) = mpsc::unbounded_channel();
        let bridge = BridgeProcess::spawn(config(silent), tx).await.unwrap();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            bridge.client().group_name("120363@g.us"),
        )
        .await
        .expect("request outlived the bridge");
        assert!(result.is_err());
    }

    #[test]
    fn test_default_data_dir_name() {
        if let Ok(dir) = default_data_dir() {
            assert!(dir.ends_with("whatsapp-history"));
        }
    }
}
