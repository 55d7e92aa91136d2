//! Process launching and byte pumping between a process and its channel.
//!
//! Launching is split in two: a synchronous `spawn_*` step that can fail and
//! is reported back to the request, and an async `run` that pumps bytes until
//! the process is done and then completes the channel (EOF, `exit-status`,
//! close).

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use portable_pty::{Child as PtyChild, ChildKiller, CommandBuilder};
use rsshd_protocol::{encode_exit_status, EXIT_STATUS, EXIT_STATUS_UNAVAILABLE};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pty::Pty;
use crate::identity::LocalUser;
use crate::transport::{ChannelIo, ChannelReader};

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the blocking pty reader and the channel.
const OUTPUT_QUEUE_DEPTH: usize = 16;

/// A command line plus the environment it runs in.
///
/// The environment is always rebuilt from scratch: `USER`, `HOME`, `TERM`
/// when a terminal was requested, then the channel's own assignments in the
/// order they arrived.
#[derive(Debug, Clone)]
pub struct Launch {
    program: PathBuf,
    args: Vec<String>,
    user: String,
    home: PathBuf,
    term: Option<String>,
    env: Vec<(String, String)>,
}

impl Launch {
    pub fn new(program: impl Into<PathBuf>, user: &LocalUser) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            user: user.name().to_string(),
            home: user.home().to_path_buf(),
            term: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = Some(term.into());
        self
    }

    pub fn envs(mut self, env: &[(String, String)]) -> Self {
        self.env.extend(env.iter().cloned());
        self
    }

    /// Final environment, in assignment order. Later entries win.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("USER".to_string(), self.user.clone()),
            ("HOME".to_string(), self.home.display().to_string()),
        ];
        if let Some(term) = &self.term {
            vars.push(("TERM".to_string(), term.clone()));
        }
        vars.extend(self.env.iter().cloned());
        vars
    }

    fn pty_command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        cmd.env_clear();
        for (key, value) in self.environment() {
            cmd.env(key, value);
        }
        cmd.cwd(&self.home);
        cmd
    }

    fn piped_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.environment())
            .current_dir(&self.home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// A launched process, awaiting its exit.
pub enum Process {
    Terminal(Box<dyn PtyChild + Send + Sync>),
    Piped(tokio::process::Child),
}

impl Process {
    /// Wait for the process and return the code to report to the peer.
    ///
    /// Signals and unavailable statuses map to [`EXIT_STATUS_UNAVAILABLE`].
    pub async fn wait_exit_code(self) -> u32 {
        match self {
            Process::Terminal(child) => {
                match tokio::task::spawn_blocking(move || wait_terminal(child)).await {
                    Ok(code) => code,
                    Err(e) => {
                        warn!(error = %e, "Wait task failed");
                        EXIT_STATUS_UNAVAILABLE
                    }
                }
            }
            Process::Piped(mut child) => match child.wait().await {
                Ok(status) => status
                    .code()
                    .and_then(|code| u32::try_from(code).ok())
                    .unwrap_or(EXIT_STATUS_UNAVAILABLE),
                Err(e) => {
                    warn!(error = %e, "Failed to wait for process");
                    EXIT_STATUS_UNAVAILABLE
                }
            },
        }
    }
}

/// Reap a pty child directly so a signal death is told apart from an exit.
/// portable-pty folds signals into exit code 1.
fn wait_terminal(mut child: Box<dyn PtyChild + Send + Sync>) -> u32 {
    let Some(pid) = child.process_id().and_then(|pid| i32::try_from(pid).ok()) else {
        return match child.wait() {
            Ok(status) => status.exit_code(),
            Err(e) => {
                warn!(error = %e, "Failed to wait for process");
                EXIT_STATUS_UNAVAILABLE
            }
        };
    };

    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return u32::try_from(code).unwrap_or(EXIT_STATUS_UNAVAILABLE)
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                debug!(signal = %signal, "Process terminated by signal");
                return EXIT_STATUS_UNAVAILABLE;
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "Failed to wait for process");
                return EXIT_STATUS_UNAVAILABLE;
            }
        }
    }
}

/// Wait for `process`, then half-close, report the exit code and close the
/// channel. Every step runs even when an earlier one failed.
pub async fn finish(process: Process, io: &ChannelIo) -> u32 {
    let code = process.wait_exit_code().await;

    if let Err(e) = io.close_write().await {
        debug!(error = %e, "Failed to half-close channel");
    }
    let status = Bytes::copy_from_slice(&encode_exit_status(code));
    if let Err(e) = io.send_request(EXIT_STATUS, false, status).await {
        debug!(error = %e, "Failed to send exit status");
    }
    if let Err(e) = io.close().await {
        debug!(error = %e, "Failed to close channel");
    }

    info!(exit_code = code, "Process exited");
    code
}

/// Why an output pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpEnd {
    /// The process side reached end-of-file.
    Drained,
    /// The channel no longer accepts data.
    ChannelGone,
}

/// A process running on a pty replica.
pub struct TerminalProcess {
    child: Box<dyn PtyChild + Send + Sync>,
    output: Box<dyn Read + Send>,
    input: Box<dyn Write + Send>,
}

/// Start `launch` on the pty's replica.
///
/// The replica is consumed and the parent's handle to it dropped, so the
/// master sees end-of-file once the process and its children exit.
pub fn spawn_terminal(launch: &Launch, pty: &mut Pty) -> Result<TerminalProcess> {
    let output = pty.reader().context("Failed to clone pty reader")?;
    let input = pty.writer().context("Failed to take pty writer")?;
    let replica = pty
        .take_replica()
        .ok_or_else(|| anyhow!("pty replica already in use"))?;

    let child = replica
        .spawn_command(launch.pty_command())
        .with_context(|| format!("Failed to spawn {}", launch.program.display()))?;
    drop(replica);

    debug!(program = %launch.program.display(), pid = ?child.process_id(), "Spawned on pty");
    Ok(TerminalProcess {
        child,
        output,
        input,
    })
}

impl TerminalProcess {
    /// Bridge the pty and the channel until the process is done.
    ///
    /// The pty→channel copy runs to end-of-file and trips the latch, which
    /// stops the channel→pty copy. If the channel goes away first the process
    /// is killed, as a terminal hangup would.
    pub async fn run(self, io: Arc<ChannelIo>, input: ChannelReader) -> u32 {
        let Self {
            mut child,
            output,
            input: pty_in,
        } = self;
        let latch = CancellationToken::new();

        let (outbound, ()) = tokio::join!(
            async {
                let end = pump_pty_output(output, &io).await;
                latch.cancel();
                end
            },
            async {
                copy_channel_to_pty(input, pty_in, &latch).await;
                latch.cancel();
            },
        );

        if outbound == PumpEnd::ChannelGone {
            debug!("Channel gone, hanging up process");
            if let Err(e) = child.kill() {
                debug!(error = %e, "Failed to kill process");
            }
        }

        finish(Process::Terminal(child), &io).await
    }
}

/// Copy pty output onto the channel.
async fn pump_pty_output(mut output: Box<dyn Read + Send>, io: &ChannelIo) -> PumpEnd {
    let (tx, mut rx) = mpsc::channel::<Bytes>(OUTPUT_QUEUE_DEPTH);

    // Reads block, so they run on the blocking pool. The master returns EIO
    // once every replica descriptor is closed; treat it like end-of-file.
    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match output.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "Pty read ended");
                    break;
                }
            }
        }
    });

    while let Some(chunk) = rx.recv().await {
        if let Err(e) = io.write(chunk).await {
            debug!(error = %e, "Channel write failed");
            return PumpEnd::ChannelGone;
        }
    }
    PumpEnd::Drained
}

/// Copy peer input into the pty until end-of-file or the latch trips.
async fn copy_channel_to_pty(
    mut input: ChannelReader,
    mut pty_in: Box<dyn Write + Send>,
    latch: &CancellationToken,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = latch.cancelled() => return,
            read = input.read(&mut buffer) => match read {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Channel read failed");
                    return;
                }
            },
        };

        let data = buffer[..n].to_vec();
        let written = tokio::task::spawn_blocking(move || {
            let result = pty_in.write_all(&data).and_then(|()| pty_in.flush());
            (pty_in, result)
        })
        .await;

        match written {
            Ok((writer, Ok(()))) => pty_in = writer,
            Ok((_, Err(e))) => {
                debug!(error = %e, "Pty write failed");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Pty write task failed");
                return;
            }
        }
    }
}

/// A process with piped stdout and stderr and a null stdin.
pub struct PipedProcess {
    child: tokio::process::Child,
}

/// Start `launch` without a terminal.
pub fn spawn_piped(launch: &Launch) -> Result<PipedProcess> {
    let child = launch
        .piped_command()
        .spawn()
        .with_context(|| format!("Failed to spawn {}", launch.program.display()))?;
    debug!(program = %launch.program.display(), pid = ?child.id(), "Spawned with pipes");
    Ok(PipedProcess { child })
}

impl PipedProcess {
    /// Copy stdout and stderr onto the channel until both are closed, then
    /// complete the channel.
    pub async fn run(self, io: Arc<ChannelIo>) -> u32 {
        let mut child = self.child;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (out, err) = tokio::join!(pump_output(stdout, &io), pump_output(stderr, &io));
        if out == PumpEnd::ChannelGone || err == PumpEnd::ChannelGone {
            debug!("Channel gone, killing process");
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Failed to kill process");
            }
        }

        finish(Process::Piped(child), &io).await
    }
}

/// Copy one async output stream onto the channel.
pub(crate) async fn pump_output<R>(source: Option<R>, io: &ChannelIo) -> PumpEnd
where
    R: AsyncRead + Unpin,
{
    let Some(mut source) = source else {
        return PumpEnd::Drained;
    };

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match source.read(&mut buffer).await {
            Ok(0) => return PumpEnd::Drained,
            Ok(n) => {
                if let Err(e) = io.write(Bytes::copy_from_slice(&buffer[..n])).await {
                    debug!(error = %e, "Channel write failed");
                    return PumpEnd::ChannelGone;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output read failed");
                return PumpEnd::Drained;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelEvent, Decision, NewChannel};
    use rsshd_protocol::{parse_exit_status, WindowSize};
    use tempfile::TempDir;
    use tokio::sync::mpsc::Receiver;

    fn test_user(home: &TempDir) -> LocalUser {
        LocalUser::new("tester", home.path())
    }

    fn channel() -> (Arc<ChannelIo>, ChannelReader, Receiver<ChannelEvent>, mpsc::UnboundedSender<Bytes>) {
        let (open, mut decision) = NewChannel::new("session");
        let (io, reader, _requests) = open.accept().unwrap();
        let Ok(Decision::Accept(link)) = decision.try_recv() else {
            panic!("expected accept");
        };
        (Arc::new(io), reader, link.events, link.data)
    }

    async fn collect(events: &mut Receiver<ChannelEvent>) -> (Vec<u8>, Vec<ChannelEvent>) {
        let mut output = Vec::new();
        let mut control = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Data(data) => output.extend_from_slice(&data),
                ChannelEvent::Close => {
                    control.push(ChannelEvent::Close);
                    break;
                }
                other => control.push(other),
            }
        }
        (output, control)
    }

    #[test]
    fn test_environment_order() {
        let home = TempDir::new().unwrap();
        let launch = Launch::new("/bin/sh", &test_user(&home))
            .term("xterm")
            .envs(&[
                ("LANG".to_string(), "C".to_string()),
                ("LANG".to_string(), "en_US.UTF-8".to_string()),
            ]);

        let env = launch.environment();
        assert_eq!(env[0], ("USER".to_string(), "tester".to_string()));
        assert_eq!(env[1].0, "HOME");
        assert_eq!(env[2], ("TERM".to_string(), "xterm".to_string()));
        assert_eq!(env.last().unwrap().1, "en_US.UTF-8");
    }

    #[test]
    fn test_environment_without_term() {
        let home = TempDir::new().unwrap();
        let env = Launch::new("/bin/sh", &test_user(&home)).environment();
        assert!(env.iter().all(|(k, _)| k != "TERM"));
    }

    #[tokio::test]
    async fn test_piped_completion_sequence() {
        let home = TempDir::new().unwrap();
        let (io, _reader, mut events, _data) = channel();

        let launch = Launch::new("/bin/sh", &test_user(&home))
            .arg("-c")
            .arg("echo out; echo err >&2; exit 7");
        let process = spawn_piped(&launch).unwrap();
        let code = process.run(Arc::clone(&io)).await;
        assert_eq!(code, 7);

        let (output, control) = collect(&mut events).await;
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));

        assert_eq!(control.len(), 3);
        assert_eq!(control[0], ChannelEvent::Eof);
        match &control[1] {
            ChannelEvent::Request {
                name,
                want_reply,
                payload,
            } => {
                assert_eq!(name, EXIT_STATUS);
                assert!(!want_reply);
                assert_eq!(parse_exit_status(payload), Some(7));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(control[2], ChannelEvent::Close);
    }

    #[tokio::test]
    async fn test_piped_env_and_cwd() {
        let home = TempDir::new().unwrap();
        let (io, _reader, mut events, _data) = channel();

        let launch = Launch::new("/bin/sh", &test_user(&home))
            .arg("-c")
            .arg("echo $USER:$GREETING; pwd")
            .envs(&[("GREETING".to_string(), "hello".to_string())]);
        spawn_piped(&launch).unwrap().run(io).await;

        let (output, _) = collect(&mut events).await;
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("tester:hello"));
        let home_path = home.path().canonicalize().unwrap();
        assert!(text.contains(home_path.to_str().unwrap()));
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let home = TempDir::new().unwrap();
        let launch = Launch::new("/nonexistent/program", &test_user(&home));
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        assert!(spawn_piped(&launch).is_err());
    }

    #[tokio::test]
    async fn test_terminal_echo_and_exit_code() {
        let home = TempDir::new().unwrap();
        let (io, reader, mut events, _data) = channel();

        let mut pty = Pty::open("vt100", WindowSize::new(80, 24)).unwrap();
        let launch = Launch::new("/bin/sh", &test_user(&home))
            .arg("-c")
            .arg("echo term=$TERM; exit 3")
            .term(pty.term());
        let process = spawn_terminal(&launch, &mut pty).unwrap();
        assert!(!pty.has_replica());

        let code = process.run(io, reader).await;
        assert_eq!(code, 3);

        let (output, control) = collect(&mut events).await;
        assert!(String::from_utf8_lossy(&output).contains("term=vt100"));
        assert_eq!(control.first(), Some(&ChannelEvent::Eof));
        assert_eq!(control.last(), Some(&ChannelEvent::Close));
    }

    #[tokio::test]
    async fn test_terminal_forwards_input() {
        let home = TempDir::new().unwrap();
        let (io, reader, mut events, data) = channel();

        let mut pty = Pty::open("vt100", WindowSize::new(80, 24)).unwrap();
        let launch = Launch::new("/bin/sh", &test_user(&home))
            .arg("-c")
            .arg("read line; echo got:$line");
        let process = spawn_terminal(&launch, &mut pty).unwrap();
        data.send(Bytes::from_static(b"ping\n")).unwrap();

        assert_eq!(process.run(io, reader).await, 0);
        let (output, _) = collect(&mut events).await;
        assert!(String::from_utf8_lossy(&output).contains("got:ping"));
    }

    fn reported_exit_status(control: &[ChannelEvent]) -> Option<u32> {
        control.iter().find_map(|event| match event {
            ChannelEvent::Request { name, payload, .. } if name == EXIT_STATUS => {
                parse_exit_status(payload)
            }
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_terminal_signal_death_reports_unavailable() {
        let home = TempDir::new().unwrap();
        let (io, reader, mut events, _data) = channel();

        let mut pty = Pty::open("vt100", WindowSize::new(80, 24)).unwrap();
        let launch = Launch::new("/bin/sh", &test_user(&home))
            .arg("-c")
            .arg("kill -9 $$");
        let process = spawn_terminal(&launch, &mut pty).unwrap();

        assert_eq!(process.run(io, reader).await, EXIT_STATUS_UNAVAILABLE);
        let (_, control) = collect(&mut events).await;
        assert_eq!(reported_exit_status(&control), Some(255));
    }

    #[tokio::test]
    async fn test_piped_signal_death_reports_unavailable() {
        let home = TempDir::new().unwrap();
        let (io, _reader, mut events, _data) = channel();

        let launch = Launch::new("/bin/sh", &test_user(&home))
            .arg("-c")
            .arg("kill -9 $$");
        let code = spawn_piped(&launch).unwrap().run(io).await;
        assert_eq!(code, EXIT_STATUS_UNAVAILABLE);

        let (_, control) = collect(&mut events).await;
        assert_eq!(reported_exit_status(&control), Some(255));
    }

    #[tokio::test]
    async fn test_terminal_input_survives_empty_chunk() {
        let home = TempDir::new().unwrap();
        let (io, reader, mut events, data) = channel();

        let mut pty = Pty::open("vt100", WindowSize::new(80, 24)).unwrap();
        let launch = Launch::new("/bin/sh", &test_user(&home))
            .arg("-c")
            .arg("read line; echo got:$line");
        let process = spawn_terminal(&launch, &mut pty).unwrap();
        data.send(Bytes::new()).unwrap();
        data.send(Bytes::from_static(b"ping\n")).unwrap();

        assert_eq!(process.run(io, reader).await, 0);
        let (output, _) = collect(&mut events).await;
        assert!(String::from_utf8_lossy(&output).contains("got:ping"));
    }

    #[tokio::test]
    async fn test_spawn_terminal_needs_replica() {
        let home = TempDir::new().unwrap();
        let mut pty = Pty::open("vt100", WindowSize::new(80, 24)).unwrap();
        pty.take_replica();

        let launch = Launch::new("/bin/sh", &test_user(&home));
        assert!(spawn_terminal(&launch, &mut pty).is_err());
    }

    #[tokio::test]
    async fn test_finish_tolerates_closed_channel() {
        let (io, _reader, events, _data) = channel();
        drop(events);

        let child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .spawn()
            .unwrap();
        assert_eq!(finish(Process::Piped(child), &io).await, 0);
    }
}
