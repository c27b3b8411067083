//! Persistent peer identity.

use libp2p::identity::Keypair;
use std::fmt::Display;
use std::path::Path;
use tracing::info;
use weft_core::error::StartupError;

fn identity_error(action: &str, path: &Path, e: impl Display) -> StartupError {
    StartupError::IdentityLoad(format!("{action} '{}': {e}", path.display()))
}

/// Load an Ed25519 keypair from `path`, or generate and persist a new one.
///
/// The file holds the raw 32-byte Ed25519 secret seed, so the peer ID stays
/// stable across restarts.
pub fn load_or_create_keypair(path: &Path) -> Result<Keypair, StartupError> {
    if path.exists() {
        let keypair = read_keypair(path)?;
        info!(path = %path.display(), "loaded existing peer identity");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    write_keypair(path, &keypair)?;
    info!(path = %path.display(), "generated new peer identity");
    Ok(keypair)
}

fn read_keypair(path: &Path) -> Result<Keypair, StartupError> {
    let seed = std::fs::read(path).map_err(|e| identity_error("failed to read", path, e))?;
    Keypair::ed25519_from_bytes(seed).map_err(|e| identity_error("invalid key in", path, e))
}

/// Write the secret seed, creating parent directories. On Unix the file is
/// restricted to mode `0o600`.
fn write_keypair(path: &Path, keypair: &Keypair) -> Result<(), StartupError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| identity_error("failed to create directory", parent, e))?;
    }

    let ed25519 = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|e| identity_error("non-Ed25519 identity for", path, e))?;
    std::fs::write(path, ed25519.secret().as_ref())
        .map_err(|e| identity_error("failed to write", path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| identity_error("failed to restrict", path, e))?;
    }
    Ok(())
}
