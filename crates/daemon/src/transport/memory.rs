//! In-process transport.
//!
//! [`pair`] returns an [`Established`] connection for the session core and a
//! [`MemoryPeer`] that plays the remote client: it opens channels, sends
//! data and requests, and observes everything the core emits.

use bytes::Bytes;
use rsshd_protocol::{parse_exit_status, OpenFailureReason, EXIT_STATUS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ChannelEvent, Decision, Established, NewChannel, Reply, Request, TransportLink,
};
use crate::error::TransportError;

const NOTIFICATION_CAPACITY: usize = 16;

/// Connection handle of an in-process transport.
#[derive(Debug, Clone)]
pub struct MemoryLink {
    closed: CancellationToken,
}

impl TransportLink for MemoryLink {
    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.closed.cancel();
        Ok(())
    }
}

/// Create a connected pair for `username`.
pub fn pair(username: impl Into<String>) -> (Established<MemoryLink>, MemoryPeer) {
    let (chan_tx, chan_rx) = mpsc::channel(NOTIFICATION_CAPACITY);
    let (global_tx, global_rx) = mpsc::channel(NOTIFICATION_CAPACITY);
    let closed = CancellationToken::new();

    let established = Established {
        username: username.into(),
        new_channels: chan_rx,
        global_requests: global_rx,
        link: MemoryLink {
            closed: closed.clone(),
        },
    };
    let peer = MemoryPeer {
        new_channels: Some(chan_tx),
        global_requests: Some(global_tx),
        closed,
    };
    (established, peer)
}

/// Why the core refused a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRejected {
    pub reason: OpenFailureReason,
    pub message: String,
}

/// The remote side of an in-process connection.
#[derive(Debug)]
pub struct MemoryPeer {
    new_channels: Option<mpsc::Sender<NewChannel>>,
    global_requests: Option<mpsc::Sender<Request>>,
    closed: CancellationToken,
}

impl MemoryPeer {
    /// Ask the core to open a channel of `channel_type`.
    pub async fn open_channel(&self, channel_type: &str) -> Result<PeerChannel, OpenRejected> {
        let hung_up = || OpenRejected {
            reason: OpenFailureReason::ConnectFailed,
            message: "connection closed".to_string(),
        };
        let sender = self.new_channels.as_ref().ok_or_else(hung_up)?;

        let (open, decision) = NewChannel::new(channel_type);
        sender.send(open).await.map_err(|_| hung_up())?;

        match decision.await.map_err(|_| hung_up())? {
            Decision::Accept(link) => Ok(PeerChannel {
                data: Some(link.data),
                requests: link.requests,
                events: link.events,
            }),
            Decision::Reject { reason, message } => Err(OpenRejected { reason, message }),
        }
    }

    /// Send a connection-level request and wait for its reply.
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: impl Into<Bytes>,
    ) -> Option<Reply> {
        let sender = self.global_requests.as_ref()?;
        let (request, reply) = Request::new(name, want_reply, payload);
        sender.send(request).await.ok()?;
        reply.await.ok()
    }

    /// Stop sending notifications, as if the peer disconnected.
    pub fn hang_up(&mut self) {
        self.new_channels = None;
        self.global_requests = None;
    }

    /// Whether the core closed the connection.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the core closes the connection.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// The remote side of one accepted channel.
#[derive(Debug)]
pub struct PeerChannel {
    data: Option<mpsc::UnboundedSender<Bytes>>,
    requests: mpsc::UnboundedSender<Request>,
    events: mpsc::Receiver<ChannelEvent>,
}

impl PeerChannel {
    /// Send bytes to the channel's process. Returns false once the channel
    /// stopped reading or EOF was sent.
    pub fn send_data(&self, data: impl Into<Bytes>) -> bool {
        self.data
            .as_ref()
            .is_some_and(|tx| tx.send(data.into()).is_ok())
    }

    /// Signal end-of-file on the inbound stream.
    pub fn send_eof(&mut self) {
        self.data = None;
    }

    /// Send a channel request. Resolves to the reply, or `None` when no
    /// reply was asked for or the channel is gone.
    pub async fn request(
        &self,
        name: &str,
        want_reply: bool,
        payload: impl Into<Bytes>,
    ) -> Option<Reply> {
        let (request, reply) = Request::new(name, want_reply, payload);
        self.requests.send(request).ok()?;
        reply.await.ok()
    }

    /// Next event emitted by the core, or `None` once it dropped the channel.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Collect events until the channel is closed or dropped.
    pub async fn transcript(&mut self) -> Transcript {
        let mut transcript = Transcript::default();
        while let Some(event) = self.events.recv().await {
            match event {
                ChannelEvent::Data(data) => {
                    if transcript.eof {
                        transcript.data_after_eof = true;
                    }
                    transcript.output.extend_from_slice(&data);
                }
                ChannelEvent::Eof => transcript.eof = true,
                ChannelEvent::Request { name, payload, .. } => {
                    if name == EXIT_STATUS {
                        if let Some(code) = parse_exit_status(&payload) {
                            transcript.exit_statuses.push(code);
                        }
                    }
                    transcript.requests.push(name);
                }
                ChannelEvent::Close => {
                    transcript.closes += 1;
                    break;
                }
            }
        }
        transcript
    }
}

/// Everything the core sent on a channel up to its close.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub output: Vec<u8>,
    pub eof: bool,
    pub data_after_eof: bool,
    pub requests: Vec<String>,
    pub exit_statuses: Vec<u32>,
    pub closes: usize,
}

impl Transcript {
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}
