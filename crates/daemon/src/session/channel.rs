//! Per-channel request handling.
//!
//! A session channel moves through Init → PtyReady → Running → Closed
//! without an explicit state field: the state is whatever `pty` and
//! `started` say. Requests are handled one at a time in arrival order;
//! each handler is synchronous and either succeeds or returns a
//! [`RequestError`] that becomes the failure reply.

use std::sync::Arc;

use rsshd_protocol::{
    parse_string, parse_strings, parse_window_size, RequestKind, SFTP_SUBSYSTEM,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::bridge::{self, Launch};
use super::pty::Pty;
use super::sftp::SftpServer;
use super::SessionSettings;
use crate::error::RequestError;
use crate::identity::LocalUser;
use crate::transport::{ChannelIo, ChannelReader, Request};

type Handler = fn(&mut Channel, &[u8]) -> Result<(), RequestError>;

/// Request dispatch table.
const HANDLERS: [(RequestKind, Handler); 6] = [
    (RequestKind::Subsystem, Channel::handle_subsystem),
    (RequestKind::PtyReq, Channel::handle_pty_req),
    (RequestKind::WindowChange, Channel::handle_window_change),
    (RequestKind::Env, Channel::handle_env),
    (RequestKind::Shell, Channel::handle_shell),
    (RequestKind::Exec, Channel::handle_exec),
];

fn handler_for(name: &str) -> Option<(RequestKind, Handler)> {
    let kind = RequestKind::from_name(name)?;
    HANDLERS.iter().find(|(k, _)| *k == kind).copied()
}

/// Connection-wide state every channel needs.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub user: Arc<LocalUser>,
    pub settings: Arc<SessionSettings>,
    /// Tracks processes and subsystems started by channels.
    pub tracker: TaskTracker,
}

/// One session channel.
pub struct Channel {
    id: u64,
    io: Arc<ChannelIo>,
    input: Option<ChannelReader>,
    requests: mpsc::UnboundedReceiver<Request>,
    env: Vec<(String, String)>,
    pty: Option<Pty>,
    started: bool,
    scope: CancellationToken,
    context: ChannelContext,
}

impl Channel {
    pub fn new(
        id: u64,
        io: Arc<ChannelIo>,
        input: ChannelReader,
        requests: mpsc::UnboundedReceiver<Request>,
        scope: CancellationToken,
        context: ChannelContext,
    ) -> Self {
        Self {
            id,
            io,
            input: Some(input),
            requests,
            env: Vec::new(),
            pty: None,
            started: false,
            scope,
            context,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Handle requests until the request stream closes or the channel is
    /// cancelled. Returns the pty, if one was allocated, so the connection
    /// can release it at teardown.
    pub async fn run(mut self) -> Option<Pty> {
        loop {
            let request = tokio::select! {
                _ = self.scope.cancelled() => {
                    debug!(channel = self.id, "Channel cancelled");
                    break;
                }
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.process_request(request);
        }

        debug!(channel = self.id, "Channel request loop ended");
        self.pty.take()
    }

    /// Dispatch one request and send its reply.
    fn process_request(&mut self, mut request: Request) {
        let name = request.name().to_string();
        let result = match handler_for(&name) {
            Some((kind, handler)) if kind.starts_process() => self
                .ensure_idle()
                .and_then(|()| handler(self, request.payload())),
            Some((_, handler)) => handler(self, request.payload()),
            None => Err(RequestError::unsupported("unsupported req type", name.clone())),
        };

        match result {
            Ok(()) => {
                debug!(channel = self.id, request = %name, "Request accepted");
                request.reply(true, None);
            }
            Err(e) => {
                warn!(channel = self.id, request = %name, error = %e, "Request failed");
                request.reply(false, Some(e.to_string()));
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), RequestError> {
        if self.started || self.input.is_none() {
            return Err(RequestError::precondition(
                "command already running",
                "a shell, command or subsystem was already started on this channel",
            ));
        }
        Ok(())
    }

    /// Mark the channel running and hand its input stream to the caller.
    fn claim_input(&mut self) -> Result<ChannelReader, RequestError> {
        self.ensure_idle()?;
        let input = self.input.take().ok_or_else(|| {
            RequestError::precondition("command already running", "channel input already taken")
        })?;
        self.started = true;
        Ok(input)
    }

    fn handle_subsystem(&mut self, payload: &[u8]) -> Result<(), RequestError> {
        let (name, _) = parse_string(payload)
            .map_err(|e| RequestError::malformed("failed to find the subsystem requested", e))?;
        if name != SFTP_SUBSYSTEM {
            return Err(RequestError::unsupported("unsupported subsystem", name));
        }

        let server = SftpServer::spawn(&self.context.settings.sftp_server, &self.context.user)
            .map_err(|e| {
                RequestError::allocation("failed to create sftp server over channel", format!("{e:#}"))
            })?;
        let input = self.claim_input()?;

        info!(channel = self.id, user = %self.context.user.name(), "Starting sftp subsystem");
        self.context
            .tracker
            .spawn(server.serve(input, Arc::clone(&self.io)));
        Ok(())
    }

    fn handle_pty_req(&mut self, payload: &[u8]) -> Result<(), RequestError> {
        if self.pty.is_some() {
            return Err(RequestError::precondition(
                "pty already allocated",
                "only one pty may be requested per channel",
            ));
        }

        let (term, consumed) = parse_string(payload)
            .map_err(|e| RequestError::malformed("failed to parse terminfo", e))?;
        let size = parse_window_size(&payload[consumed..])
            .map_err(|e| RequestError::malformed("failed to parse window size", e))?;

        let pty = Pty::open(term, size)
            .map_err(|e| RequestError::allocation("failed to create new pty", format!("{e:#}")))?;

        debug!(channel = self.id, term = %pty.term(), cols = size.cols, rows = size.rows, "Allocated pty");
        self.pty = Some(pty);
        Ok(())
    }

    fn handle_window_change(&mut self, payload: &[u8]) -> Result<(), RequestError> {
        let Some(pty) = &self.pty else {
            return Err(RequestError::precondition("cannot setup pty", "pty is not setup"));
        };

        let size = parse_window_size(payload)
            .map_err(|e| RequestError::malformed("failed to parse window size", e))?;
        pty.resize(size)
            .map_err(|e| RequestError::allocation("failed to set window size", format!("{e:#}")))?;

        debug!(channel = self.id, cols = size.cols, rows = size.rows, "Resized pty");
        Ok(())
    }

    fn handle_env(&mut self, payload: &[u8]) -> Result<(), RequestError> {
        let (name, consumed) = parse_string(payload)
            .map_err(|e| RequestError::malformed("failed to get environment name", e))?;
        let (value, _) = parse_string(&payload[consumed..])
            .map_err(|e| RequestError::malformed("failed to get environment value", e))?;

        debug!(channel = self.id, name = %name, "Set environment variable");
        self.env.push((name, value));
        Ok(())
    }

    fn handle_shell(&mut self, payload: &[u8]) -> Result<(), RequestError> {
        if !payload.is_empty() {
            return Err(RequestError::precondition(
                "shell doesn't accept payload",
                format!("got {} bytes", payload.len()),
            ));
        }

        let shell = self.context.settings.shell.clone();
        let Some(pty) = self.pty.as_mut().filter(|pty| pty.has_replica()) else {
            return Err(RequestError::precondition(
                "pty is not yet setup",
                "shell requires a pty",
            ));
        };

        let launch = Launch::new(&shell, &self.context.user)
            .term(pty.term())
            .envs(&self.env);
        let process = bridge::spawn_terminal(&launch, pty)
            .map_err(|e| RequestError::allocation("failed to start command", format!("{e:#}")))?;
        let input = self.claim_input()?;

        info!(channel = self.id, user = %self.context.user.name(), shell = %shell.display(), "Started shell");
        self.context
            .tracker
            .spawn(process.run(Arc::clone(&self.io), input));
        Ok(())
    }

    fn handle_exec(&mut self, payload: &[u8]) -> Result<(), RequestError> {
        let tokens = parse_strings(payload)
            .map_err(|e| RequestError::malformed("failed to parse command", e))?;
        if tokens.is_empty() {
            return Err(RequestError::precondition(
                "no commands in exec",
                "empty command line",
            ));
        }

        let line = tokens.join(" ");
        let launch = Launch::new(&self.context.settings.shell, &self.context.user)
            .arg("-c")
            .arg(line.as_str())
            .envs(&self.env);

        match self.pty.as_mut().filter(|pty| pty.has_replica()) {
            Some(pty) => {
                let launch = launch.term(pty.term());
                let process = bridge::spawn_terminal(&launch, pty).map_err(|e| {
                    RequestError::allocation("failed to start command", format!("{e:#}"))
                })?;
                let input = self.claim_input()?;
                info!(channel = self.id, command = %line, "Started command on pty");
                self.context
                    .tracker
                    .spawn(process.run(Arc::clone(&self.io), input));
            }
            None => {
                let process = bridge::spawn_piped(&launch).map_err(|e| {
                    RequestError::allocation("failed to start command", format!("{e:#}"))
                })?;
                // Piped commands get a null stdin; the channel input is unused.
                drop(self.claim_input()?);
                info!(channel = self.id, command = %line, "Started command");
                self.context.tracker.spawn(process.run(Arc::clone(&self.io)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelEvent, ChannelLink, Decision, NewChannel, Reply};
    use bytes::{BufMut, Bytes, BytesMut};
    use rsshd_protocol::{put_string, PtyRequest, WindowSize};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn test_channel(home: &TempDir) -> (Channel, ChannelLink) {
        let (open, mut decision) = NewChannel::new("session");
        let (io, input, requests) = open.accept().unwrap();
        let Ok(Decision::Accept(link)) = decision.try_recv() else {
            panic!("expected accept");
        };

        let context = ChannelContext {
            user: Arc::new(LocalUser::new("tester", home.path())),
            settings: Arc::new(SessionSettings {
                shell: PathBuf::from("/bin/sh"),
                sftp_server: PathBuf::from("/nonexistent/sftp-server"),
            }),
            tracker: TaskTracker::new(),
        };
        let channel = Channel::new(7, Arc::new(io), input, requests, CancellationToken::new(), context);
        (channel, link)
    }

    fn send(channel: &mut Channel, name: &str, payload: impl Into<Bytes>) -> Reply {
        let (request, mut reply) = Request::new(name, true, payload);
        channel.process_request(request);
        reply.try_recv().unwrap()
    }

    fn strings(values: &[&str]) -> Bytes {
        let mut buf = BytesMut::new();
        for value in values {
            put_string(&mut buf, value.as_bytes());
        }
        buf.freeze()
    }

    fn pty_req(cols: u32, rows: u32) -> Bytes {
        PtyRequest {
            term: "xterm".to_string(),
            size: WindowSize::new(cols, rows),
            modes: vec![0],
        }
        .encode()
        .freeze()
    }

    fn window(cols: u32, rows: u32) -> Bytes {
        let mut buf = BytesMut::new();
        WindowSize::new(cols, rows).encode(&mut buf);
        buf.freeze()
    }

    fn message(reply: &Reply) -> &str {
        reply.message.as_deref().unwrap_or_default()
    }

    #[test]
    fn test_handler_table_covers_every_kind() {
        for kind in RequestKind::ALL {
            assert!(handler_for(kind.as_str()).is_some(), "{kind}");
        }
        assert!(handler_for("x11-req").is_none());
    }

    #[tokio::test]
    async fn test_unknown_request_fails() {
        let home = TempDir::new().unwrap();
        let (mut channel, _link) = test_channel(&home);

        let reply = send(&mut channel, "x11-req", Bytes::new());
        assert!(!reply.ok);
        assert_eq!(message(&reply), "unsupported req type: x11-req");
    }

    #[tokio::test]
    async fn test_no_reply_when_not_wanted() {
        let home = TempDir::new().unwrap();
        let (mut channel, _link) = test_channel(&home);

        let (request, mut reply) = Request::new("bogus", false, Bytes::new());
        channel.process_request(request);
        assert!(reply.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_env_appends_in_order() {
        let home = TempDir::new().unwrap();
        let (mut channel, _link) = test_channel(&home);

        assert!(send(&mut channel, "env", strings(&["LANG", "C"])).ok);
        assert!(send(&mut channel, "env", strings(&["LANG", "POSIX"])).ok);
        assert_eq!(
            channel.env,
            vec![
                ("LANG".to_string(), "C".to_string()),
                ("LANG".to_string(), "POSIX".to_string())
            ]
        );

        let reply = send(&mut channel, "env", strings(&["ONLY_NAME"]));
        assert!(!reply.ok);
        assert!(message(&reply).starts_with("failed to get environment value"));

        let reply = send(&mut channel, "env", Bytes::from_static(b"\x00\x00"));
        assert!(message(&reply).starts_with("failed to get environment name"));
        assert_eq!(channel.env.len(), 2);
    }

    #[tokio::test]
    async fn test_window_change_requires_pty() {
        let home = TempDir::new().unwrap();
        let (mut channel, _link) = test_channel(&home);

        let reply = send(&mut channel, "window-change", window(80, 24));
        assert!(!reply.ok);
        assert_eq!(message(&reply), "cannot setup pty: pty is not setup");
    }

    #[tokio::test]
    async fn test_pty_req_then_resize() {
        let home = TempDir::new().unwrap();
        let (mut channel, _link) = test_channel(&home);

        assert!(send(&mut channel, "pty-req", pty_req(100, 40)).ok);
        let size = channel.pty.as_ref().unwrap().size().unwrap();
        assert_eq!((size.cols, size.rows), (100, 40));

        assert!(send(&mut channel, "window-change", window(120, 50)).ok);
        let size = channel.pty.as_ref().unwrap().size().unwrap();
        assert_eq!((size.cols, size.rows), (120, 50));

        // Zero leaves the size alone.
        assert!(send(&mut channel, "window-change", window(0, 10)).ok);
        let size = channel.pty.as_ref().unwrap().size().unwrap();
        assert_eq!((size.cols, size.rows), (120, 50));

        let reply = send(&mut channel, "window-change", Bytes::from_static(b"\x00\x00\x00\x50"));
        assert!(message(&reply).starts_with("failed to parse window size"));
    }

    #[tokio::test]
    async fn test_second_pty_req_rejected() {
        let home = TempDir::new().unwrap();
        let (mut channel, _link) = test_channel(&home);

        assert!(send(&mut channel, "pty-req", pty_req(80, 24)).ok);
        let reply = send(&mut channel, "pty-req", pty_req(80, 24));
        assert!(!reply.ok);
        assert!(message(&reply).starts_with("pty already allocated"));
    }

    #[tokio::test]
    async fn test_malformed_pty_req_leaves_no_pty() {
        let home = TempDir::new().unwrap();
        let (mut channel, _link) = test_channel(&home);

        let reply = send(&mut channel, "pty-req", Bytes::from_static(b"\x00\x00"));
        assert!(message(&reply).starts_with("failed to parse terminfo"));

        let mut payload = BytesMut::new();
        put_string(&mut payload, b"xterm");
        payload.put_u32(80);
        let reply = send(&mut channel, "pty-req", payload.freeze());
        assert!(message(&reply).starts_with("failed to parse window size"));

        assert!(channel.pty.is_none());
    }

    #[tokio::test]
    async fn test_shell_rules() {
        let home = TempDir::new().unwrap();
        let (mut channel, _link) = test_channel(&home);

        let reply = send(&mut channel, "shell", Bytes::from_static(b"x"));
        assert!(message(&reply).starts_with("shell doesn't accept payload"));
        assert!(matches!(
            channel.handle_shell(b"x"),
            Err(RequestError::PreconditionUnmet {
                context: "shell doesn't accept payload",
                ..
            })
        ));

        let reply = send(&mut channel, "shell", Bytes::new());
        assert_eq!(message(&reply), "pty is not yet setup: shell requires a pty");
        assert!(!channel.started);
    }

    #[tokio::test]
    async fn test_exec_parse_failures() {
        let home = TempDir::new().unwrap();
        let (mut channel, _link) = test_channel(&home);

        let reply = send(&mut channel, "exec", Bytes::new());
        assert!(message(&reply).starts_with("no commands in exec"));

        let reply = send(&mut channel, "exec", Bytes::from_static(b"\x00\x00\x00\x09ls"));
        assert!(message(&reply).starts_with("failed to parse command"));
        assert!(!channel.started);
    }

    #[tokio::test]
    async fn test_exec_runs_once() {
        let home = TempDir::new().unwrap();
        let (mut channel, mut link) = test_channel(&home);

        assert!(send(&mut channel, "exec", strings(&["echo", "joined"])).ok);
        let reply = send(&mut channel, "exec", strings(&["true"]));
        assert!(!reply.ok);
        assert!(message(&reply).starts_with("command already running"));

        let reply = send(&mut channel, "subsystem", strings(&["sftp"]));
        assert!(message(&reply).starts_with("command already running"));

        // The running check comes before payload validation.
        let reply = send(&mut channel, "shell", Bytes::from_static(b"x"));
        assert!(message(&reply).starts_with("command already running"));
        let reply = send(&mut channel, "exec", Bytes::new());
        assert!(message(&reply).starts_with("command already running"));

        let mut output = Vec::new();
        while let Some(event) = link.events.recv().await {
            match event {
                ChannelEvent::Data(data) => output.extend_from_slice(&data),
                ChannelEvent::Close => break,
                _ => {}
            }
        }
        assert_eq!(output, b"joined\n");
    }

    #[tokio::test]
    async fn test_subsystem_rules() {
        let home = TempDir::new().unwrap();
        let (mut channel, _link) = test_channel(&home);

        let reply = send(&mut channel, "subsystem", Bytes::from_static(b"\x00"));
        assert!(message(&reply).starts_with("failed to find the subsystem requested"));

        let reply = send(&mut channel, "subsystem", strings(&["netconf"]));
        assert_eq!(message(&reply), "unsupported subsystem: netconf");

        let reply = send(&mut channel, "subsystem", strings(&["sftp"]));
        assert!(message(&reply).starts_with("failed to create sftp server over channel"));
        assert!(!channel.started);
    }

    #[tokio::test]
    async fn test_run_returns_pty_on_close() {
        let home = TempDir::new().unwrap();
        let (channel, link) = test_channel(&home);
        let requests = link.requests.clone();
        let task = tokio::spawn(channel.run());

        let (request, reply) = Request::new("pty-req", true, pty_req(80, 24));
        requests.send(request).unwrap();
        assert!(reply.await.unwrap().ok);

        drop(requests);
        drop(link);
        let pty = task.await.unwrap();
        assert!(pty.is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let home = TempDir::new().unwrap();
        let (channel, _link) = test_channel(&home);
        let scope = channel.scope.clone();
        let task = tokio::spawn(channel.run());

        scope.cancel();
        assert!(task.await.unwrap().is_none());
    }
}
