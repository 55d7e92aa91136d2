//! Session layer of an authenticated connection.
//!
//! [`ServerConn`] owns the connection and dispatches channel opens; every
//! session channel runs a [`Channel`] request loop, which may start a
//! process through the [`bridge`] or the SFTP subsystem.

pub mod bridge;
pub mod channel;
pub mod conn;
pub mod pty;
pub mod sftp;

use std::path::PathBuf;

use crate::config::SessionConfig;

pub use channel::{Channel, ChannelContext};
pub use conn::ServerConn;
pub use pty::Pty;

/// What sessions run on behalf of the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Shell for `shell` requests and the interpreter for `exec`.
    pub shell: PathBuf,
    /// Binary serving the `sftp` subsystem.
    pub sftp_server: PathBuf,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            sftp_server: config.sftp_server.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = SessionConfig {
            shell: PathBuf::from("/bin/zsh"),
            sftp_server: PathBuf::from("/usr/libexec/sftp-server"),
        };
        let settings = SessionSettings::from(&config);
        assert_eq!(settings.shell, PathBuf::from("/bin/zsh"));
        assert_eq!(settings.sftp_server, PathBuf::from("/usr/libexec/sftp-server"));
    }
}
