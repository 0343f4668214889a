//! On-disk layout under the user home directory.
//!
//! `~/.claudish-proxy/` holds proxy-owned state (certs, bridge token, debug
//! logs); `~/.claudish/` holds provider credentials and per-session usage
//! snapshots. Directories are created with owner-only traversal and secret
//! files are written atomically with restrictive modes.

use crate::error::ProxyError;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const PROXY_DIR: &str = ".claudish-proxy";
pub const CREDS_DIR: &str = ".claudish";

#[derive(Debug, Clone)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    pub fn new() -> Result<Self, ProxyError> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| ProxyError::Config("HOME is not set".to_string()))?;
        Ok(Self { home })
    }

    /// Construct with an explicit home, for tests.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn proxy_dir(&self) -> PathBuf {
        self.home.join(PROXY_DIR)
    }

    pub fn creds_dir(&self) -> PathBuf {
        self.home.join(CREDS_DIR)
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.proxy_dir().join("certs")
    }

    pub fn ca_cert(&self) -> PathBuf {
        self.certs_dir().join("ca.pem")
    }

    pub fn ca_key(&self) -> PathBuf {
        self.certs_dir().join("ca-key.pem")
    }

    pub fn bridge_token(&self) -> PathBuf {
        self.proxy_dir().join("bridge-token")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.proxy_dir().join("logs")
    }

    pub fn oauth_credentials(&self, provider: &str) -> PathBuf {
        self.creds_dir().join(format!("{provider}-oauth.json"))
    }

    pub fn device_id_file(&self) -> PathBuf {
        self.creds_dir().join("kimi-device-id")
    }

    pub fn tokens_file(&self, port: u16) -> PathBuf {
        self.creds_dir().join(format!("tokens-{port}.json"))
    }
}

/// Create `dir` (and parents) with owner-only traversal.
pub fn ensure_private_dir(dir: &Path) -> Result<(), ProxyError> {
    fs::create_dir_all(dir)
        .map_err(|e| ProxyError::Config(format!("cannot create {}: {e}", dir.display())))?;
    set_mode(dir, 0o700)?;
    Ok(())
}

/// Atomically write `contents` to `path` with the given unix mode.
///
/// The temp file is created in the same directory so the rename cannot
/// cross filesystems, and it carries the final mode from the start so the
/// contents are never observable with wider permissions.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), ProxyError> {
    let parent = path
        .parent()
        .ok_or_else(|| ProxyError::Internal(format!("{} has no parent", path.display())))?;

    let tmp = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));

    let mut file = open_create_with_mode(&tmp, mode)
        .map_err(|e| ProxyError::Config(format!("cannot create {}: {e}", tmp.display())))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| ProxyError::Config(format!("cannot write {}: {e}", tmp.display())))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        ProxyError::Config(format!("cannot persist {}: {e}", path.display()))
    })?;
    Ok(())
}

#[cfg(unix)]
fn open_create_with_mode(path: &Path, mode: u32) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
}

#[cfg(not(unix))]
fn open_create_with_mode(path: &Path, _mode: u32) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), ProxyError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| ProxyError::Config(format!("cannot chmod {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), ProxyError> {
    Ok(())
}

/// Load the stable device id, generating and persisting one on first use.
pub fn load_or_create_device_id(paths: &Paths) -> Result<String, ProxyError> {
    let path = paths.device_id_file();
    if let Ok(existing) = fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    ensure_private_dir(&paths.creds_dir())?;
    let id = uuid::Uuid::new_v4().to_string();
    write_atomic(&path, id.as_bytes(), 0o600)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let p = Paths::with_home("/home/u");
        assert_eq!(p.ca_cert(), PathBuf::from("/home/u/.claudish-proxy/certs/ca.pem"));
        assert_eq!(
            p.oauth_credentials("gemini"),
            PathBuf::from("/home/u/.claudish/gemini-oauth.json")
        );
        assert_eq!(p.tokens_file(1234), PathBuf::from("/home/u/.claudish/tokens-1234.json"));
    }

    #[test]
    fn test_write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        write_atomic(&path, b"one", 0o600).unwrap();
        write_atomic(&path, b"two", 0o600).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_atomic_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        write_atomic(&path, b"s", 0o600).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_device_id_stable() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let a = load_or_create_device_id(&paths).unwrap();
        let b = load_or_create_device_id(&paths).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 36);
    }
}
