//! Protocol vocabulary for the session layer.
//!
//! Names of channel types, channel requests, and out-of-band messages, plus
//! the channel-open failure reason codes from RFC 4254 section 5.1.

use std::fmt;

/// The only channel type the session layer accepts.
pub const SESSION_CHANNEL: &str = "session";

/// The only subsystem the session layer serves.
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// Out-of-band message carrying a process exit code.
pub const EXIT_STATUS: &str = "exit-status";

/// Exit code reported when the real one is unavailable.
pub const EXIT_STATUS_UNAVAILABLE: u32 = 255;

/// Channel request types understood by a session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Start a named subsystem.
    Subsystem,
    /// Allocate a pseudo-terminal.
    PtyReq,
    /// Resize the pseudo-terminal.
    WindowChange,
    /// Set an environment variable.
    Env,
    /// Start an interactive shell.
    Shell,
    /// Run a command.
    Exec,
}

impl RequestKind {
    /// All request kinds, in dispatch table order.
    pub const ALL: [RequestKind; 6] = [
        RequestKind::Subsystem,
        RequestKind::PtyReq,
        RequestKind::WindowChange,
        RequestKind::Env,
        RequestKind::Shell,
        RequestKind::Exec,
    ];

    /// Wire name of the request type.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Subsystem => "subsystem",
            RequestKind::PtyReq => "pty-req",
            RequestKind::WindowChange => "window-change",
            RequestKind::Env => "env",
            RequestKind::Shell => "shell",
            RequestKind::Exec => "exec",
        }
    }

    /// Look up a request kind by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Whether a successful request of this kind starts a process or subsystem.
    pub fn starts_process(self) -> bool {
        matches!(
            self,
            RequestKind::Subsystem | RequestKind::Shell | RequestKind::Exec
        )
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason codes for `SSH_MSG_CHANNEL_OPEN_FAILURE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpenFailureReason {
    /// The server refuses the open by policy.
    AdministrativelyProhibited = 1,
    /// The connection target could not be reached.
    ConnectFailed = 2,
    /// The channel type is not supported.
    UnknownChannelType = 3,
    /// Not enough resources to open the channel.
    ResourceShortage = 4,
}

impl OpenFailureReason {
    /// Numeric wire code.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for OpenFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OpenFailureReason::AdministrativelyProhibited => "administratively prohibited",
            OpenFailureReason::ConnectFailed => "connect failed",
            OpenFailureReason::UnknownChannelType => "unknown channel type",
            OpenFailureReason::ResourceShortage => "resource shortage",
        };
        f.write_str(text)
    }
}
