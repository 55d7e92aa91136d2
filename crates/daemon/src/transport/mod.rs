//! Message-passing boundary between the session core and an SSH transport.
//!
//! The core never touches the transport library directly. Everything it
//! needs arrives or leaves through the endpoints defined here:
//!
//! ```text
//!            transport side                 |          session core
//! ------------------------------------------+-------------------------------
//!  mpsc<NewChannel> ----------------------> | ServerConn::run
//!      NewChannel::accept <- Decision ----- |   (accept / reject)
//!  ChannelLink.data     (Bytes)  ---------> | ChannelReader (AsyncRead)
//!  ChannelLink.requests (Request) --------> | Channel::run
//!      Request::reply   <- Reply ---------- |
//!  ChannelLink.events <- ChannelEvent ----- | ChannelIo (write/eof/exit/close)
//!  mpsc<Request> (global) ----------------> | discard task
//!  TransportLink::close <------------------ | ServerConn::close
//! ```
//!
//! [`ssh`] adapts a real SSH connection to these endpoints, [`memory`]
//! provides an in-process peer.

pub mod keys;
pub mod memory;
pub mod ssh;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use rsshd_protocol::OpenFailureReason;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;

/// Capacity of the outbound event queue of one channel.
pub const CHANNEL_EVENT_CAPACITY: usize = 64;

/// Acknowledgement for a request that asked for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Whether the request succeeded.
    pub ok: bool,
    /// Diagnostic text for failures.
    pub message: Option<String>,
}

/// A named request with an opaque payload, on a channel or the connection.
#[derive(Debug)]
pub struct Request {
    name: String,
    want_reply: bool,
    payload: Bytes,
    reply: Option<oneshot::Sender<Reply>>,
}

impl Request {
    /// Create a request and the receiver its reply arrives on.
    ///
    /// When `want_reply` is false the receiver resolves to an error once the
    /// request is dropped.
    pub fn new(
        name: impl Into<String>,
        want_reply: bool,
        payload: impl Into<Bytes>,
    ) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            name: name.into(),
            want_reply,
            payload: payload.into(),
            reply: want_reply.then_some(tx),
        };
        (request, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Answer the request. Only the first call sends anything, and only if
    /// the peer asked for a reply.
    pub fn reply(&mut self, ok: bool, message: Option<String>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Reply { ok, message });
        }
    }
}

/// Something the core wants the transport to do on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes for the peer.
    Data(Bytes),
    /// No more data will be sent.
    Eof,
    /// An out-of-band request, e.g. `exit-status`.
    Request {
        name: String,
        want_reply: bool,
        payload: Bytes,
    },
    /// Close the channel.
    Close,
}

/// The transport's half of an accepted channel.
#[derive(Debug)]
pub struct ChannelLink {
    /// Inbound data. Dropping it signals end-of-file to the core.
    pub data: mpsc::UnboundedSender<Bytes>,
    /// Inbound channel requests. Dropping it ends the channel's loop.
    pub requests: mpsc::UnboundedSender<Request>,
    /// Outbound events, in the order the core produced them.
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// The core's answer to a channel-open notification.
#[derive(Debug)]
pub enum Decision {
    Accept(ChannelLink),
    Reject {
        reason: OpenFailureReason,
        message: String,
    },
}

/// A peer asked to open a channel.
#[derive(Debug)]
pub struct NewChannel {
    channel_type: String,
    decision: oneshot::Sender<Decision>,
}

impl NewChannel {
    /// Create a notification and the receiver for the core's decision.
    pub fn new(channel_type: impl Into<String>) -> (Self, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        let open = Self {
            channel_type: channel_type.into(),
            decision: tx,
        };
        (open, rx)
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Accept the channel, returning the core's endpoints.
    pub fn accept(
        self,
    ) -> Result<(ChannelIo, ChannelReader, mpsc::UnboundedReceiver<Request>), TransportError> {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_EVENT_CAPACITY);

        let link = ChannelLink {
            data: data_tx,
            requests: req_tx,
            events: event_rx,
        };
        self.decision
            .send(Decision::Accept(link))
            .map_err(|_| TransportError::Closed)?;

        Ok((
            ChannelIo::new(event_tx),
            ChannelReader::new(data_rx),
            req_rx,
        ))
    }

    /// Refuse the channel.
    pub fn reject(self, reason: OpenFailureReason, message: impl Into<String>) {
        let _ = self.decision.send(Decision::Reject {
            reason,
            message: message.into(),
        });
    }
}

/// Write and control half of a channel, shared by everything that drives it.
#[derive(Debug)]
pub struct ChannelIo {
    events: mpsc::Sender<ChannelEvent>,
    closed: AtomicBool,
}

impl ChannelIo {
    pub fn new(events: mpsc::Sender<ChannelEvent>) -> Self {
        Self {
            events,
            closed: AtomicBool::new(false),
        }
    }

    async fn send(&self, event: ChannelEvent) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.events
            .send(event)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Send data to the peer.
    pub async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        self.send(ChannelEvent::Data(data)).await
    }

    /// Signal end-of-output to the peer.
    pub async fn close_write(&self) -> Result<(), TransportError> {
        self.send(ChannelEvent::Eof).await
    }

    /// Send an out-of-band request.
    pub async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.send(ChannelEvent::Request {
            name: name.to_string(),
            want_reply,
            payload,
        })
        .await
    }

    /// Close the channel. Later calls are no-ops.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.events
            .send(ChannelEvent::Close)
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Read half of a channel. Reaches end-of-file when the peer sends EOF or
/// the transport drops the channel.
#[derive(Debug)]
pub struct ChannelReader {
    reader: mpsc::UnboundedReceiver<Bytes>,
    read_buf: BytesMut,
}

impl ChannelReader {
    pub fn new(reader: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            reader,
            read_buf: BytesMut::new(),
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.read_buf.is_empty() {
            let to_copy = buf.remaining().min(self.read_buf.len());
            buf.put_slice(&self.read_buf[..to_copy]);
            self.read_buf.advance(to_copy);
            return Poll::Ready(Ok(()));
        }

        // An empty chunk must not read as end-of-file.
        loop {
            match self.reader.poll_recv(cx) {
                Poll::Ready(Some(data)) if data.is_empty() => continue,
                Poll::Ready(Some(data)) => {
                    let to_copy = buf.remaining().min(data.len());
                    buf.put_slice(&data[..to_copy]);
                    if to_copy < data.len() {
                        self.read_buf.extend_from_slice(&data[to_copy..]);
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Connection-level control over the transport.
pub trait TransportLink: Send + Sync + 'static {
    /// Tear down the whole connection.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// An authenticated connection, ready for the session core.
#[derive(Debug)]
pub struct Established<L> {
    /// Name the peer authenticated as.
    pub username: String,
    /// Channel-open notifications.
    pub new_channels: mpsc::Receiver<NewChannel>,
    /// Connection-level requests.
    pub global_requests: mpsc::Receiver<Request>,
    /// Control handle for the connection.
    pub link: L,
}
