//! TCP listener feeding accepted sockets into [`ServerConn`]s.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::session::{ServerConn, SessionSettings};
use crate::transport::keys;
use crate::transport::ssh::Acceptor;

/// A bound listener plus everything needed to serve connections on it.
pub struct Server {
    listener: TcpListener,
    acceptor: Acceptor,
    settings: Arc<SessionSettings>,
}

impl Server {
    /// Load keys and bind the configured listen address.
    pub async fn bind(config: &Config) -> Result<Self> {
        let host_key = keys::load_or_generate_host_key(&config.host_key_path())?;
        info!(fingerprint = %keys::fingerprint(host_key.public_key()), "Host key ready");
        let authorized = keys::load_authorized_keys(&config.authorized_keys_path())?;

        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        Ok(Self {
            listener,
            acceptor: Acceptor::new(host_key, authorized),
            settings: Arc::new(SessionSettings::from(&config.session)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept connections until `shutdown` is cancelled, then wait for the
    /// open connections to drain.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        info!(addr = %self.local_addr()?, "Listening for SSH connections");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer, "Accepted TCP connection");
            tracker.spawn(handle_connection(
                shutdown.clone(),
                stream,
                peer,
                self.acceptor.clone(),
                Arc::clone(&self.settings),
            ));
        }

        tracker.close();
        info!(connections = tracker.len(), "Shutting down, draining connections");
        tracker.wait().await;
        Ok(())
    }
}

/// Bind according to `config` and serve until `shutdown`.
pub async fn serve(config: &Config, shutdown: CancellationToken) -> Result<()> {
    Server::bind(config).await?.serve(shutdown).await
}

async fn handle_connection(
    parent: CancellationToken,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Acceptor,
    settings: Arc<SessionSettings>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let conn = match ServerConn::accept(&parent, stream, Some(peer), &acceptor, settings).await {
        Ok(conn) => conn,
        Err(e) => {
            info!(peer = %peer, error = %e, "Connection setup failed");
            return;
        }
    };

    info!(peer = %peer, user = %conn.user().name(), "Session started");
    conn.run().await;

    if let Err(e) = conn.close().await {
        warn!(peer = %peer, error = %e, "Connection teardown incomplete");
    }
    info!(peer = %peer, "Session ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config
    }

    #[tokio::test]
    async fn test_bind_generates_host_key() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let server = Server::bind(&config).await.unwrap();
        assert!(config.host_key_path().exists());
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_serves_banner_and_stops() {
        let temp_dir = TempDir::new().unwrap();
        let server = Server::bind(&test_config(&temp_dir)).await.unwrap();
        let addr = server.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(shutdown.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut banner = [0u8; 13];
        stream.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SSH-2.0-rsshd");
        drop(stream);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.server.listen_addr = "not-an-address".to_string();
        assert!(Server::bind(&config).await.is_err());
    }
}
