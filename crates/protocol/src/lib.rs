//! # rsshd Protocol Library
//!
//! Wire formats used inside SSH channel request payloads, and the names the
//! session layer dispatches on.
//!
//! ## Overview
//!
//! - **Codec**: length-prefixed strings and window-size quads (RFC 4254)
//! - **Messages**: request kinds, channel types, exit-status, open-failure codes
//!
//! ## Example Usage
//!
//! ```rust
//! use rsshd_protocol::{parse_string, parse_window_size, WindowSize};
//!
//! let (name, consumed) = parse_string(&[0, 0, 0, 4, b's', b'f', b't', b'p']).unwrap();
//! assert_eq!((name.as_str(), consumed), ("sftp", 8));
//!
//! let quad: Vec<u8> = [80u32, 24, 0, 0].iter().flat_map(|v| v.to_be_bytes()).collect();
//! assert_eq!(parse_window_size(&quad).unwrap(), WindowSize::new(80, 24));
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: payload parsers and encoders
//! - [`messages`]: protocol vocabulary
//! - [`error`]: error types

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{
    encode_exit_status, parse_bytes, parse_exit_status, parse_string, parse_strings,
    parse_window_size, put_string, PtyRequest, WindowSize, LENGTH_PREFIX_SIZE, TTY_OP_END,
    WINDOW_SIZE_LEN,
};
pub use error::{Result, WireError};
pub use messages::{
    OpenFailureReason, RequestKind, EXIT_STATUS, EXIT_STATUS_UNAVAILABLE, SESSION_CHANNEL,
    SFTP_SUBSYSTEM,
};
