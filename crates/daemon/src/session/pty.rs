//! Pseudo-terminal pairs owned by session channels.
//!
//! A channel allocates at most one pair on `pty-req`. The master stays with
//! the channel for resizes; the replica is handed to the first process
//! started on the channel and dropped by the parent once that process runs.

use std::io::{Read, Write};

use anyhow::Result;
use portable_pty::{native_pty_system, MasterPty, PtyPair, PtySize, SlavePty};
use rsshd_protocol::WindowSize;
use tracing::warn;

/// Apply a window size to a pty master.
///
/// A zero in either dimension leaves the terminal untouched. Values beyond
/// the kernel's 16-bit fields are clamped.
pub fn set_window_size(master: &dyn MasterPty, size: WindowSize) -> Result<()> {
    if size.rows == 0 || size.cols == 0 {
        return Ok(());
    }

    master.resize(PtySize {
        rows: clamp(size.rows),
        cols: clamp(size.cols),
        pixel_width: clamp(size.pixel_width),
        pixel_height: clamp(size.pixel_height),
    })
}

fn clamp(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// A pseudo-terminal pair plus the terminal type the peer asked for.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    replica: Option<Box<dyn SlavePty + Send>>,
    term: String,
}

impl Pty {
    /// Allocate a new pair and apply the requested size.
    pub fn open(term: impl Into<String>, size: WindowSize) -> Result<Self> {
        let pair = native_pty_system().openpty(PtySize::default())?;
        Ok(Self::from_pair(pair, term, size))
    }

    /// Wrap an allocated pair. A failed initial resize keeps the default
    /// size and is only logged.
    fn from_pair(pair: PtyPair, term: impl Into<String>, size: WindowSize) -> Self {
        if let Err(e) = set_window_size(pair.master.as_ref(), size) {
            warn!(error = %e, cols = size.cols, rows = size.rows, "Failed to set initial pty size");
        }

        Self {
            master: pair.master,
            replica: Some(pair.slave),
            term: term.into(),
        }
    }

    /// Terminal type from the `pty-req`, exported as `TERM`.
    pub fn term(&self) -> &str {
        &self.term
    }

    /// Re-apply a window size.
    pub fn resize(&self, size: WindowSize) -> Result<()> {
        set_window_size(self.master.as_ref(), size)
    }

    /// Current size as reported by the kernel.
    pub fn size(&self) -> Result<PtySize> {
        self.master.get_size()
    }

    /// Whether the replica is still available for a process.
    pub fn has_replica(&self) -> bool {
        self.replica.is_some()
    }

    /// Hand the replica to a process launcher. Returns `None` once taken.
    pub fn take_replica(&mut self) -> Option<Box<dyn SlavePty + Send>> {
        self.replica.take()
    }

    /// Independent reader over the master side.
    pub fn reader(&self) -> Result<Box<dyn Read + Send>> {
        self.master.try_clone_reader()
    }

    /// The master's writer. May only be taken once.
    pub fn writer(&self) -> Result<Box<dyn Write + Send>> {
        self.master.take_writer()
    }
}

impl std::fmt::Debug for Pty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pty")
            .field("term", &self.term)
            .field("has_replica", &self.replica.is_some())
            .finish()
    }
}
