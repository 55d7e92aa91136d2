//! Server side of one authenticated SSH connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rsshd_protocol::{OpenFailureReason, SESSION_CHANNEL};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelContext};
use super::pty::Pty;
use super::SessionSettings;
use crate::error::{ConnectError, ShutdownError};
use crate::identity::LocalUser;
use crate::transport::ssh::{Acceptor, SshLink};
use crate::transport::{ChannelIo, Established, NewChannel, Request, TransportLink};

/// A channel the connection has accepted, kept until teardown.
struct ChannelSlot {
    id: u64,
    scope: CancellationToken,
    io: Arc<ChannelIo>,
    /// Resolves with the channel's pty once its request loop ends.
    released: oneshot::Receiver<Option<Pty>>,
}

/// An authenticated connection and every channel opened on it.
///
/// Work started on behalf of the connection (channel loops, processes,
/// subsystems) is tracked so [`ServerConn::close`] can drain it before
/// releasing anything.
pub struct ServerConn<L: TransportLink> {
    user: Arc<LocalUser>,
    settings: Arc<SessionSettings>,
    link: L,
    new_channels: Mutex<mpsc::Receiver<NewChannel>>,
    scope: CancellationToken,
    tracker: TaskTracker,
    channels: Mutex<Vec<ChannelSlot>>,
    next_id: AtomicU64,
}

impl ServerConn<SshLink> {
    /// Run the SSH handshake on `stream` and establish the connection.
    pub async fn accept<S>(
        parent: &CancellationToken,
        stream: S,
        peer: Option<SocketAddr>,
        acceptor: &Acceptor,
        settings: Arc<SessionSettings>,
    ) -> Result<Self, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let established = acceptor.handshake(stream, peer).await?;
        Self::establish(parent, established, settings).await
    }
}

impl<L: TransportLink> ServerConn<L> {
    /// Resolve the authenticated user and take over the connection.
    ///
    /// The transport is closed if the user has no local account.
    pub async fn establish(
        parent: &CancellationToken,
        established: Established<L>,
        settings: Arc<SessionSettings>,
    ) -> Result<Self, ConnectError> {
        let user = match LocalUser::lookup(&established.username) {
            Ok(user) => user,
            Err(e) => {
                warn!(user = %established.username, error = %e, "Rejecting connection");
                if let Err(close_err) = established.link.close().await {
                    debug!(error = %close_err, "Failed to close transport");
                }
                return Err(e.into());
            }
        };
        Ok(Self::with_user(parent, established, user, settings))
    }

    /// Take over the connection as an already-resolved `user`.
    pub fn with_user(
        parent: &CancellationToken,
        established: Established<L>,
        user: LocalUser,
        settings: Arc<SessionSettings>,
    ) -> Self {
        let Established {
            username,
            new_channels,
            global_requests,
            link,
        } = established;

        let scope = parent.child_token();
        tokio::spawn(discard_global_requests(global_requests, scope.clone()));

        info!(
            user = %username,
            uid = user.uid(),
            gid = user.gid(),
            home = %user.home().display(),
            "Connection established"
        );
        Self {
            user: Arc::new(user),
            settings,
            link,
            new_channels: Mutex::new(new_channels),
            scope,
            tracker: TaskTracker::new(),
            channels: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    /// Number of session channels accepted so far.
    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// The connection's cancellation token. Cancelling it stops the dispatch
    /// loop and every channel's request loop.
    pub fn scope(&self) -> CancellationToken {
        self.scope.clone()
    }

    /// Dispatch channel opens until the peer stops sending them or the
    /// connection is cancelled.
    pub async fn run(&self) {
        let mut new_channels = self.new_channels.lock().await;

        loop {
            let open = tokio::select! {
                _ = self.scope.cancelled() => break,
                open = new_channels.recv() => match open {
                    Some(open) => open,
                    None => break,
                },
            };

            if open.channel_type() != SESSION_CHANNEL {
                let channel_type = open.channel_type().to_string();
                info!(channel_type = %channel_type, "Rejecting channel");
                open.reject(OpenFailureReason::UnknownChannelType, channel_type);
                continue;
            }

            let (io, input, requests) = match open.accept() {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    warn!(error = %e, "Failed to accept channel");
                    continue;
                }
            };

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let io = Arc::new(io);
            let scope = self.scope.child_token();
            let channel = Channel::new(
                id,
                Arc::clone(&io),
                input,
                requests,
                scope.clone(),
                ChannelContext {
                    user: Arc::clone(&self.user),
                    settings: Arc::clone(&self.settings),
                    tracker: self.tracker.clone(),
                },
            );

            let (released_tx, released) = oneshot::channel();
            self.channels.lock().await.push(ChannelSlot {
                id,
                scope,
                io,
                released,
            });

            debug!(channel = id, "Accepted session channel");
            self.tracker.spawn(async move {
                let pty = channel.run().await;
                let _ = released_tx.send(pty);
            });
        }

        debug!(user = %self.user.name(), "Channel dispatch ended");
    }

    /// Block until every tracked task has finished.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Drain the connection, then release every channel and the transport.
    ///
    /// Release failures do not stop the teardown; they are collected and
    /// returned together.
    pub async fn close(self) -> Result<(), ShutdownError> {
        self.wait().await;

        let mut failures = ShutdownError::new();
        let channels = std::mem::take(&mut *self.channels.lock().await);
        for slot in channels {
            slot.scope.cancel();
            if let Ok(Some(pty)) = slot.released.await {
                debug!(channel = slot.id, term = %pty.term(), "Releasing pty");
                drop(pty);
            }
            if let Err(e) = slot.io.close().await {
                failures.push(format!("channel {}", slot.id), e);
            }
        }

        self.scope.cancel();
        if let Err(e) = self.link.close().await {
            failures.push("transport", e);
        }

        info!(user = %self.user.name(), failures = failures.failures().len(), "Connection closed");
        failures.into_result()
    }
}

/// Refuse every connection-level request until the connection ends.
async fn discard_global_requests(mut requests: mpsc::Receiver<Request>, scope: CancellationToken) {
    loop {
        let mut request = tokio::select! {
            _ = scope.cancelled() => return,
            request = requests.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };
        debug!(request = %request.name(), "Discarding global request");
        request.reply(false, None);
    }
}
