//! On-disk key material, created on first start.
//!
//! Two 32-byte raw key files live under the data directory: the Ed25519
//! message-signing key and the X25519 queue-decryption key. Files are
//! written atomically with owner-only permissions.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use x25519_dalek::StaticSecret;

const SIGNING_KEY_FILE: &str = "signing.key";
const QUEUE_KEY_FILE: &str = "queue.key";

pub struct NodeKeys {
    pub signing_key: SigningKey,
    pub decrypt_key: StaticSecret,
}

impl std::fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeys")
            .field("signing_key", &"<redacted>")
            .field("decrypt_key", &"<redacted>")
            .finish()
    }
}

pub fn load_or_create(dir: &Path) -> io::Result<NodeKeys> {
    let signing_bytes = load_or_create_key(&dir.join(SIGNING_KEY_FILE), || {
        SigningKey::generate(&mut OsRng).to_bytes().to_vec()
    })?;
    let decrypt_bytes = load_or_create_key(&dir.join(QUEUE_KEY_FILE), || {
        StaticSecret::random_from_rng(OsRng).to_bytes().to_vec()
    })?;
    Ok(NodeKeys {
        signing_key: SigningKey::from_bytes(&fixed32(&signing_bytes)?),
        decrypt_key: StaticSecret::from(fixed32(&decrypt_bytes)?),
    })
}

fn fixed32(bytes: &[u8]) -> io::Result<[u8; 32]> {
    bytes.try_into().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "key file must hold exactly 32 bytes")
    })
}

fn load_or_create_key(path: &Path, generate: impl FnOnce() -> Vec<u8>) -> io::Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => return Ok(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    let bytes = generate();
    write_key_file(path, &bytes)?;
    log::info!("generated new key file {}", path.display());
    Ok(bytes)
}

fn write_key_file(path: &Path, key_bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let unique = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let tmp_path = path.with_extension(format!("tmp-{unique}"));
    write_private_key_tmp(&tmp_path, key_bytes)?;

    #[cfg(windows)]
    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp_path, path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

fn write_private_key_tmp(path: &Path, key_bytes: &[u8]) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;
        let mut options = OpenOptions::new();
        options.write(true).create_new(true).mode(0o600);
        let mut file = options.open(path)?;
        file.write_all(key_bytes)?;
        file.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        use std::fs::OpenOptions;
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        let mut file = options.open(path)?;
        file.write_all(key_bytes)?;
        file.sync_all()?;
        Ok(())
    }
}
