//! russh adapter.
//!
//! [`Acceptor::handshake`] runs the SSH protocol on a background task and
//! resolves once the peer has authenticated. From then on the
//! [`SessionHandler`] turns russh callbacks into transport notifications:
//! channel opens become [`NewChannel`]s, channel requests are re-encoded to
//! their RFC 4254 payloads and forwarded as [`Request`]s, and each accepted
//! channel gets a driver task that writes the core's events back onto the
//! russh session handle.
//!
//! A request callback holds the session until the core has answered, then
//! replies through the [`Session`]. russh only sends that reply when the
//! peer asked for one, so a request without `want_reply` gets nothing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect, MethodKind, MethodSet, Pty};
use rsshd_protocol::{
    parse_exit_status, put_string, PtyRequest, RequestKind, WindowSize, EXIT_STATUS,
    SESSION_CHANNEL, TTY_OP_END,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::keys;
use super::{ChannelEvent, Decision, Established, NewChannel, Reply, Request, TransportLink};
use crate::error::TransportError;

/// Identification string sent to clients.
pub const SERVER_ID: &str = "SSH-2.0-rsshd";

/// Time a client has to authenticate.
pub const LOGIN_GRACE: Duration = Duration::from_secs(120);

const NOTIFICATION_CAPACITY: usize = 16;

/// Accepts raw streams and runs the SSH handshake on them.
#[derive(Clone)]
pub struct Acceptor {
    config: Arc<russh::server::Config>,
    authorized_keys: Arc<Vec<PublicKey>>,
}

impl Acceptor {
    /// Public-key-only server using `host_key`.
    pub fn new(host_key: PrivateKey, authorized_keys: Vec<PublicKey>) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.server_id = russh::SshId::Standard(SERVER_ID.to_string());
        config.methods = MethodSet::from(&[MethodKind::PublicKey][..]);
        config.max_auth_attempts = 3;
        config.auth_rejection_time = Duration::from_secs(1);

        Self {
            config: Arc::new(config),
            authorized_keys: Arc::new(authorized_keys),
        }
    }

    /// Run the handshake on `stream` and wait for authentication.
    pub async fn handshake<S>(
        &self,
        stream: S,
        peer: Option<SocketAddr>,
    ) -> Result<Established<SshLink>, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (auth_tx, auth_rx) = oneshot::channel();
        let (chan_tx, chan_rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        let (global_tx, global_rx) = mpsc::channel(NOTIFICATION_CAPACITY);

        let handler = SessionHandler {
            peer,
            authorized_keys: Arc::clone(&self.authorized_keys),
            user: None,
            authenticated: Some(auth_tx),
            new_channels: chan_tx,
            global_requests: global_tx,
            channels: HashMap::new(),
        };

        let session = russh::server::run_stream(Arc::clone(&self.config), stream, handler)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let driver = tokio::spawn(async move {
            if let Err(e) = session.await {
                debug!(peer = ?peer, error = %e, "SSH session ended with error");
            }
        });

        match tokio::time::timeout(LOGIN_GRACE, auth_rx).await {
            Ok(Ok(Authenticated { username, handle })) => Ok(Established {
                username,
                new_channels: chan_rx,
                global_requests: global_rx,
                link: SshLink {
                    handle,
                    driver: Mutex::new(Some(driver)),
                },
            }),
            Ok(Err(_)) => Err(TransportError::Handshake(
                "connection closed before authentication".to_string(),
            )),
            Err(_) => {
                driver.abort();
                Err(TransportError::Handshake(
                    "authentication timed out".to_string(),
                ))
            }
        }
    }
}

/// Connection handle for a russh session.
pub struct SshLink {
    handle: Handle,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl TransportLink for SshLink {
    async fn close(&self) -> Result<(), TransportError> {
        let Some(driver) = self.driver.lock().await.take() else {
            return Ok(());
        };

        if !driver.is_finished() {
            let sent = self
                .handle
                .disconnect(
                    Disconnect::ByApplication,
                    "session closed".to_string(),
                    "en".to_string(),
                )
                .await;
            if let Err(e) = sent {
                if !driver.is_finished() {
                    return Err(TransportError::Other(e.to_string()));
                }
            }
        }

        driver
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

struct Authenticated {
    username: String,
    handle: Handle,
}

struct ChannelPorts {
    data: Option<mpsc::UnboundedSender<Bytes>>,
    requests: mpsc::UnboundedSender<Request>,
}

/// russh callbacks for one connection.
pub struct SessionHandler {
    peer: Option<SocketAddr>,
    authorized_keys: Arc<Vec<PublicKey>>,
    user: Option<String>,
    authenticated: Option<oneshot::Sender<Authenticated>>,
    new_channels: mpsc::Sender<NewChannel>,
    global_requests: mpsc::Sender<Request>,
    channels: HashMap<ChannelId, ChannelPorts>,
}

impl SessionHandler {
    /// Ask the core whether to accept a channel, wiring it up if so.
    async fn open(&mut self, id: ChannelId, channel_type: &str, session: &mut Session) -> bool {
        let (open, decision) = NewChannel::new(channel_type);
        if self.new_channels.send(open).await.is_err() {
            return false;
        }

        match decision.await {
            Ok(Decision::Accept(link)) => {
                tokio::spawn(drive_channel(session.handle(), id, link.events));
                self.channels.insert(
                    id,
                    ChannelPorts {
                        data: Some(link.data),
                        requests: link.requests,
                    },
                );
                true
            }
            Ok(Decision::Reject { reason, message }) => {
                debug!(
                    peer = ?self.peer,
                    channel = ?id,
                    reason = reason.code(),
                    message = %message,
                    "Channel open rejected"
                );
                false
            }
            Err(_) => false,
        }
    }

    /// Hand a channel request to the core and answer it once the core has.
    ///
    /// russh hides `want_reply`, so the core is always asked for a reply.
    /// The session drops it when the peer did not want one.
    async fn forward(
        &mut self,
        id: ChannelId,
        kind: RequestKind,
        payload: Bytes,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let ok = match self.channels.get(&id) {
            Some(ports) => {
                let (request, reply) = Request::new(kind.as_str(), true, payload);
                if ports.requests.send(request).is_err() {
                    debug!(channel = ?id, kind = %kind, "Channel no longer takes requests");
                }
                matches!(reply.await, Ok(Reply { ok: true, .. }))
            }
            None => {
                warn!(channel = ?id, kind = %kind, "Request for unknown channel");
                false
            }
        };

        if ok {
            session.channel_success(id)
        } else {
            session.channel_failure(id)
        }
    }

    async fn global_request(&self, name: &str, payload: Bytes) -> bool {
        let (request, reply) = Request::new(name, true, payload);
        if self.global_requests.send(request).await.is_err() {
            return false;
        }
        matches!(reply.await, Ok(Reply { ok: true, .. }))
    }
}

impl russh::server::Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        info!(peer = ?self.peer, user = %user, "Password auth rejected");
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = keys::fingerprint(public_key);
        if keys::is_authorized(&self.authorized_keys, public_key) {
            info!(peer = ?self.peer, user = %user, key = %fingerprint, "Public key accepted");
            self.user = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            info!(peer = ?self.peer, user = %user, key = %fingerprint, "Public key rejected");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        if let (Some(tx), Some(username)) = (self.authenticated.take(), self.user.clone()) {
            let _ = tx.send(Authenticated {
                username,
                handle: session.handle(),
            });
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open(channel.id(), SESSION_CHANNEL, session).await)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open(channel.id(), "x11", session).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open(channel.id(), "direct-tcpip", session).await)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(tx) = self.channels.get(&channel).and_then(|p| p.data.as_ref()) {
            let _ = tx.send(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ports) = self.channels.get_mut(&channel) {
            ports.data = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, "Peer closed channel");
        self.channels.remove(&channel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = PtyRequest {
            term: term.to_string(),
            size: WindowSize {
                cols: col_width,
                rows: row_height,
                pixel_width: pix_width,
                pixel_height: pix_height,
            },
            modes: encode_modes(modes),
        };
        self.forward(channel, RequestKind::PtyReq, request.encode().freeze(), session)
            .await?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        WindowSize {
            cols: col_width,
            rows: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
        }
        .encode(&mut payload);
        self.forward(channel, RequestKind::WindowChange, payload.freeze(), session)
            .await?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, variable_name.as_bytes());
        put_string(&mut payload, variable_value.as_bytes());
        self.forward(channel, RequestKind::Env, payload.freeze(), session)
            .await?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, RequestKind::Shell, Bytes::new(), session)
            .await?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, data);
        self.forward(channel, RequestKind::Exec, payload.freeze(), session)
            .await?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, name.as_bytes());
        self.forward(channel, RequestKind::Subsystem, payload.freeze(), session)
            .await?;
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .global_request("tcpip-forward", forward_payload(address, *port))
            .await)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .global_request("cancel-tcpip-forward", forward_payload(address, port))
            .await)
    }
}

fn forward_payload(address: &str, port: u32) -> Bytes {
    let mut payload = BytesMut::new();
    put_string(&mut payload, address.as_bytes());
    payload.put_u32(port);
    payload.freeze()
}

/// Encode terminal modes as opcode/value pairs ending in `TTY_OP_END`.
fn encode_modes(modes: &[(Pty, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(modes.len() * 5 + 1);
    for (mode, value) in modes {
        out.push(*mode as u8);
        out.extend_from_slice(&value.to_be_bytes());
    }
    out.push(TTY_OP_END);
    out
}

/// Write one channel's events to the russh session.
async fn drive_channel(handle: Handle, id: ChannelId, mut events: mpsc::Receiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let sent = match event {
            ChannelEvent::Data(data) => handle.data(id, CryptoVec::from_slice(&data)).await.is_ok(),
            ChannelEvent::Eof => handle.eof(id).await.is_ok(),
            ChannelEvent::Request { name, payload, .. } if name == EXIT_STATUS => {
                match parse_exit_status(&payload) {
                    Some(code) => handle.exit_status_request(id, code).await.is_ok(),
                    None => {
                        warn!(channel = ?id, "Malformed exit-status payload");
                        true
                    }
                }
            }
            ChannelEvent::Request { name, .. } => {
                warn!(channel = ?id, request = %name, "Outbound request not supported");
                true
            }
            ChannelEvent::Close => {
                let _ = handle.close(id).await;
                break;
            }
        };
        if !sent {
            debug!(channel = ?id, "Session handle gone, stopping channel driver");
            break;
        }
    }
}
