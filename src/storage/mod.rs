//! Key-share persistence: one JSON blob per protocol under the peer home.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tracing::info;

use crate::models::{Protocol, TssConfig};

pub const KEYGEN_FILE_NAME: &str = "keygen_data.json";

/// Errors are split by kind so the facade can report the protocol-specific
/// "no keygen data found" condition precisely.
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("keygen data directory missing: {0}")]
    DirMissingErr(String),
    #[error("no keygen file found in: {0}")]
    FileMissingErr(String),
    #[error("malformed keygen data: {0}")]
    MalformedErr(String),
    #[error("io error: {0}")]
    IoErr(#[from] std::io::Error),
}

pub type StorageResult<Success> = Result<Success, StorageError>;

pub trait KeyStore: Send + Sync {
    fn write_keygen(&self, protocol: Protocol, config: &TssConfig) -> StorageResult<()>;
    fn load_keygen(&self, protocol: Protocol) -> StorageResult<TssConfig>;
    fn keygen_exists(&self, protocol: Protocol) -> bool;
}

/// File-backed store rooted at the peer home. Writes truncate in place with
/// mode 0600; the file is only read back at startup and sign-init, so a
/// partial write after a crash surfaces as [`StorageError::MalformedErr`].
pub struct FileKeyStore {
    home: PathBuf,
}

impl FileKeyStore {
    pub fn new(home: PathBuf) -> Self {
        FileKeyStore { home }
    }

    fn protocol_dir(&self, protocol: Protocol) -> PathBuf {
        self.home.join(protocol.as_str())
    }

    /// Returns the keygen file inside the protocol directory, located by the
    /// `keygen` name fragment.
    fn find_keygen_file(&self, protocol: Protocol) -> StorageResult<PathBuf> {
        let dir = self.protocol_dir(protocol);
        let entries = fs::read_dir(&dir)
            .map_err(|_| StorageError::DirMissingErr(dir.display().to_string()))?;

        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().contains("keygen") {
                return Ok(entry.path());
            }
        }
        Err(StorageError::FileMissingErr(dir.display().to_string()))
    }
}

impl KeyStore for FileKeyStore {
    fn write_keygen(&self, protocol: Protocol, config: &TssConfig) -> StorageResult<()> {
        let dir = self.protocol_dir(protocol);
        fs::create_dir_all(&dir)?;
        let path = dir.join(KEYGEN_FILE_NAME);

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;

        let bytes = serde_json::to_vec_pretty(config)
            .map_err(|err| StorageError::MalformedErr(err.to_string()))?;
        file.write_all(&bytes)?;
        file.flush()?;

        info!(path = %path.display(), "keygen data written");
        Ok(())
    }

    fn load_keygen(&self, protocol: Protocol) -> StorageResult<TssConfig> {
        let path = self.find_keygen_file(protocol)?;
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|err| {
            StorageError::MalformedErr(format!("{}: {}", path.display(), err))
        })
    }

    fn keygen_exists(&self, protocol: Protocol) -> bool {
        self.protocol_dir(protocol).join(KEYGEN_FILE_NAME).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KeyShare, MetaData};

    fn sample_config() -> TssConfig {
        TssConfig {
            meta_data: MetaData {
                peers_count: 3,
                threshold: 2,
            },
            keygen_data: KeyShare {
                share_id: "12345".to_string(),
                pub_key: "aabb".to_string(),
                payload: serde_json::json!({"devSecret": "00ff"}),
            },
        }
    }

    #[test]
    fn write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().to_path_buf());

        assert!(!store.keygen_exists(Protocol::Eddsa));
        store.write_keygen(Protocol::Eddsa, &sample_config()).unwrap();
        assert!(store.keygen_exists(Protocol::Eddsa));

        let loaded = store.load_keygen(Protocol::Eddsa).unwrap();
        assert_eq!(loaded.keygen_data.share_id, "12345");
        assert_eq!(loaded.meta_data.threshold, 2);

        // the other protocol slot stays independent
        assert!(!store.keygen_exists(Protocol::Ecdsa));
        assert!(matches!(
            store.load_keygen(Protocol::Ecdsa),
            Err(StorageError::DirMissingErr(_))
        ));
    }

    #[test]
    fn missing_file_and_malformed_data_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().to_path_buf());

        std::fs::create_dir_all(dir.path().join("eddsa")).unwrap();
        assert!(matches!(
            store.load_keygen(Protocol::Eddsa),
            Err(StorageError::FileMissingErr(_))
        ));

        std::fs::write(dir.path().join("eddsa").join(KEYGEN_FILE_NAME), b"not json").unwrap();
        assert!(matches!(
            store.load_keygen(Protocol::Eddsa),
            Err(StorageError::MalformedErr(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn keygen_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().to_path_buf());
        store.write_keygen(Protocol::Ecdsa, &sample_config()).unwrap();

        let path = dir.path().join("ecdsa").join(KEYGEN_FILE_NAME);
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
