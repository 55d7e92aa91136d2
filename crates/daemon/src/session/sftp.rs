//! SFTP subsystem backed by an external `sftp-server` binary.
//!
//! The binary speaks the SFTP protocol on stdin/stdout; this module only
//! moves bytes between it and the channel.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bridge::{pump_output, PumpEnd};
use crate::identity::LocalUser;
use crate::transport::{ChannelIo, ChannelReader};

/// A running SFTP server process.
#[derive(Debug)]
pub struct SftpServer {
    child: Child,
}

impl SftpServer {
    /// Start `program` in the user's home directory.
    pub fn spawn(program: &Path, user: &LocalUser) -> Result<Self> {
        let child = tokio::process::Command::new(program)
            .env_clear()
            .env("USER", user.name())
            .env("HOME", user.home())
            .current_dir(user.home())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.display()))?;

        debug!(program = %program.display(), pid = ?child.id(), "Started sftp server");
        Ok(Self { child })
    }

    /// Serve the channel until the server exits, then close the channel.
    ///
    /// Returns the server's exit code when it exited normally.
    pub async fn serve(mut self, mut input: ChannelReader, io: Arc<ChannelIo>) -> Option<i32> {
        let stdin = self.child.stdin.take();
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        let latch = CancellationToken::new();

        let inbound = async {
            let Some(mut stdin) = stdin else { return };
            tokio::select! {
                _ = latch.cancelled() => {}
                copied = tokio::io::copy(&mut input, &mut stdin) => {
                    if let Err(e) = copied {
                        debug!(error = %e, "Channel to sftp copy failed");
                    }
                    let _ = stdin.shutdown().await;
                }
            }
        };
        let outbound = async {
            let end = pump_output(stdout, &io).await;
            latch.cancel();
            end
        };

        let ((), end, ()) = tokio::join!(inbound, outbound, log_stderr(stderr));
        if end == PumpEnd::ChannelGone {
            if let Err(e) = self.child.start_kill() {
                debug!(error = %e, "Failed to kill sftp server");
            }
        }

        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "Failed to wait for sftp server");
                None
            }
        };
        info!(exit_code = ?code, "SFTP session ended");

        if let Err(e) = io.close_write().await {
            debug!(error = %e, "Failed to half-close channel");
        }
        if let Err(e) = io.close().await {
            debug!(error = %e, "Failed to close channel");
        }
        code
    }
}

async fn log_stderr(stderr: Option<ChildStderr>) {
    let Some(stderr) = stderr else { return };
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(line = %line, "sftp-server");
    }
}
