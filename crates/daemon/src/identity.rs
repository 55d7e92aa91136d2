//! Local account lookup for authenticated remote users.

use std::path::{Path, PathBuf};

use nix::unistd::User;
use thiserror::Error;

/// Errors resolving a remote username to a local account.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No local account carries this name.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// The account database could not be queried.
    #[error("failed to look up user {name}: {source}")]
    Lookup {
        /// The name being resolved.
        name: String,
        /// The underlying OS error.
        #[source]
        source: nix::Error,
    },
}

/// A resolved local account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    name: String,
    uid: u32,
    gid: u32,
    home: PathBuf,
}

impl LocalUser {
    /// Resolve `name` through the system account database.
    pub fn lookup(name: &str) -> Result<Self, IdentityError> {
        let user = User::from_name(name)
            .map_err(|source| IdentityError::Lookup {
                name: name.to_string(),
                source,
            })?
            .ok_or_else(|| IdentityError::UnknownUser(name.to_string()))?;

        Ok(Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        })
    }

    /// Build an identity without consulting the account database.
    pub fn new(name: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            home: home.into(),
        }
    }

    /// Account name, exported to processes as `USER`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Home directory, exported as `HOME` and used as working directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Numeric user id, logged with the connection.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Primary group id.
    pub fn gid(&self) -> u32 {
        self.gid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_root() {
        let user = LocalUser::lookup("root").unwrap();
        assert_eq!(user.name(), "root");
        assert_eq!(user.uid(), 0);
        assert!(user.home().is_absolute());
    }

    #[test]
    fn test_lookup_unknown_user() {
        let err = LocalUser::lookup("rsshd-no-such-user").unwrap_err();
        assert!(matches!(err, IdentityError::UnknownUser(ref n) if n == "rsshd-no-such-user"));
        assert_eq!(err.to_string(), "unknown user: rsshd-no-such-user");
    }

    #[test]
    fn test_new_uses_current_ids() {
        let user = LocalUser::new("alice", "/home/alice");
        assert_eq!(user.name(), "alice");
        assert_eq!(user.home(), Path::new("/home/alice"));
        assert_eq!(user.uid(), nix::unistd::getuid().as_raw());
    }
}
