//! Host key and authorized key handling.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use russh::keys::ssh_key::{HashAlg, LineEnding};
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use tracing::{debug, info, warn};

/// Load the host key at `path`, generating and persisting an Ed25519 key
/// when the file does not exist.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read host key: {}", path.display()))?;
        let key = russh::keys::decode_secret_key(&content, None)
            .with_context(|| format!("Failed to decode host key: {}", path.display()))?;
        debug!(path = %path.display(), "Loaded host key");
        return Ok(key);
    }

    info!(path = %path.display(), "Generating new Ed25519 host key");
    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .context("Failed to generate host key")?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create key directory: {}", parent.display()))?;
    }
    fs::write(path, pem.as_bytes())
        .with_context(|| format!("Failed to write host key: {}", path.display()))?;
    restrict_permissions(path)?;

    Ok(key)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// `SHA256:...` fingerprint of a public key.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Parse an OpenSSH `authorized_keys` document.
///
/// Blank lines and comments are skipped. Lines with an options prefix are
/// accepted; the options themselves are ignored. Lines that do not parse
/// are logged and skipped.
pub fn parse_authorized_keys(content: &str) -> Vec<PublicKey> {
    let mut keys = Vec::new();

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_authorized_line(line) {
            Some(key) => keys.push(key),
            None => warn!(line = lineno + 1, "Skipping unparsable authorized key"),
        }
    }

    keys
}

fn parse_authorized_line(line: &str) -> Option<PublicKey> {
    if let Ok(key) = PublicKey::from_openssh(line) {
        return Some(key);
    }

    // Options prefix: retry from each whitespace boundary.
    line.match_indices(char::is_whitespace)
        .find_map(|(idx, _)| PublicKey::from_openssh(line[idx..].trim_start()).ok())
}

/// Read an `authorized_keys` file. A missing file yields no keys.
pub fn load_authorized_keys(path: &Path) -> Result<Vec<PublicKey>> {
    if !path.exists() {
        warn!(path = %path.display(), "authorized_keys not found, no key will be accepted");
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read authorized keys: {}", path.display()))?;
    let keys = parse_authorized_keys(&content);
    info!(path = %path.display(), count = keys.len(), "Loaded authorized keys");
    Ok(keys)
}

/// Whether `key` appears in `authorized`.
pub fn is_authorized(authorized: &[PublicKey], key: &PublicKey) -> bool {
    authorized.iter().any(|k| k.key_data() == key.key_data())
}
