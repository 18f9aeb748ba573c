use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use common::Credentials;

/// Write `value` as JSON so that it survives power loss right after return:
/// temp file, fsync, rename over the target, fsync the directory.
pub fn write_json_durable<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let bytes = serde_json::to_vec(value).map_err(std::io::Error::other)?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;

    #[cfg(unix)]
    {
        fs::File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Read a JSON document; `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Identity credentials obtained by pairing.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Option<Credentials> {
        match read_json::<Credentials>(&self.path) {
            Ok(creds) => creds,
            Err(e) => {
                warn!(path=%self.path.display(), error=%e, "unreadable credentials, treating node as unpaired");
                None
            }
        }
    }

    pub fn is_paired(&self) -> bool {
        self.load().is_some()
    }

    pub fn save(&self, creds: &Credentials) -> std::io::Result<()> {
        info!(path=%self.path.display(), user=%creds.user_id, "saving credentials");
        write_json_durable(&self.path, creds)
    }

    /// Forget the identity; the next boot pairs again.
    pub fn clear(&self) -> std::io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path=%self.path.display(), "credentials removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            user_id: "u1".into(),
            token: "t".into(),
            network_key: "k".into(),
            node_id: "A".into(),
        }
    }

    #[test]
    fn credentials_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("nested").join("credentials.json"));
        assert!(!store.is_paired());
        store.save(&creds()).unwrap();
        assert_eq!(store.load(), Some(creds()));
        assert!(!dir.path().join("nested").join("credentials.json.tmp").exists());
        store.clear().unwrap();
        assert!(!store.is_paired());
        store.clear().unwrap();
    }

    #[test]
    fn corrupt_credentials_count_as_unpaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(CredentialStore::new(path).load().is_none());
    }
}
