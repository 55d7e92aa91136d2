//! # rsshd
//!
//! Session and channel layer of an SSH server.
//!
//! ## Overview
//!
//! Once a peer has authenticated, the daemon:
//!
//! - **Resolves the user** to a local account
//! - **Dispatches channels**: only `session` channels are accepted
//! - **Runs requests** per channel in order: `pty-req`, `window-change`,
//!   `env`, `shell`, `exec` and the `sftp` subsystem
//! - **Bridges processes** to the channel through a pty or pipes and reports
//!   their exit status
//! - **Tears down** in order: drain tracked work, release channels, close the
//!   transport
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ server: TcpListener ── transport::ssh::Acceptor (russh)  │
//! ├──────────────────────────────────────────────────────────┤
//! │ transport: NewChannel / Request / ChannelIo seam         │
//! ├──────────────────────────────────────────────────────────┤
//! │ session::ServerConn                                      │
//! │   └─ session::Channel (one per session channel)          │
//! │        ├─ session::bridge (shell / exec)                 │
//! │        └─ session::sftp   (sftp subsystem)               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rsshd::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let shutdown = CancellationToken::new();
//!     rsshd::server::serve(&config, shutdown).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`error`]: Request, transport and teardown errors
//! - [`identity`]: Local account lookup
//! - [`server`]: TCP listener
//! - [`session`]: Connection, channel, process bridge and SFTP
//! - [`transport`]: Transport seam, russh adapter, in-process transport

pub mod config;
pub mod error;
pub mod identity;
pub mod server;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use rsshd_protocol as protocol;

pub use config::Config;
pub use error::{ConnectError, RequestError, ShutdownError, TransportError};
pub use identity::LocalUser;
pub use server::Server;
pub use session::{ServerConn, SessionSettings};
