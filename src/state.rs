//! Temporary on-disk state shared across process restarts.
//!
//! The store is a flat directory of small files addressed by key. It holds
//! the persisted root credential (`cacert.pem` / `cakey.pem`) and the
//! snapshot of the operating system proxy settings taken before the proxy
//! installed itself (`reg_values.json`).
//!
//! Writes go through a uniquely named temporary file followed by a rename,
//! so readers never observe a half-written value. [`TempStore::write_if_absent`]
//! uses exclusive creation, so two processes racing to seed the same key
//! cannot overwrite each other.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Directory name used under the system temp directory.
pub const STATE_DIR_NAME: &str = "fast-proxy";

/// Key of the persisted root certificate.
pub const CA_CERT_KEY: &str = "cacert.pem";

/// Key of the persisted root private key.
pub const CA_KEY_KEY: &str = "cakey.pem";

/// Key of the saved operating system proxy settings.
pub const PROXY_SNAPSHOT_KEY: &str = "reg_values.json";

/// Errors raised by the state store.
#[derive(Debug, Error)]
pub enum StateError {
    /// Filesystem operation failed.
    #[error("State file {path}: {source}")]
    Io {
        /// File involved in the failed operation.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Stored JSON could not be encoded or decoded.
    #[error("State file {path} holds invalid JSON: {source}")]
    Json {
        /// File involved in the failed operation.
        path: PathBuf,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

/// Key-value file persistence rooted at a single directory.
#[derive(Debug, Clone)]
pub struct TempStore {
    root: PathBuf,
}

impl TempStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under `<system temp>/fast-proxy`.
    pub fn default_location() -> Self {
        Self::new(std::env::temp_dir().join(STATE_DIR_NAME))
    }

    /// Directory holding the stored files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the file backing `key`.
    pub fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Whether a value is stored under `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.path_of(key).is_file()
    }

    /// Read the value stored under `key`, or `None` when nothing is stored.
    pub fn read(&self, key: &str) -> Result<Option<String>, StateError> {
        let path = self.path_of(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StateError::Io { path, source }),
        }
    }

    /// Store `contents` under `key`, replacing any previous value.
    pub fn write(&self, key: &str, contents: &str) -> Result<(), StateError> {
        self.ensure_root()?;
        let path = self.path_of(key);
        let staging = self.root.join(format!(".{}.{}.tmp", key, Uuid::new_v4()));

        write_restricted(&staging, contents, false)?;
        fs::rename(&staging, &path).map_err(|source| {
            let _ = fs::remove_file(&staging);
            StateError::Io {
                path: path.clone(),
                source,
            }
        })?;

        trace!("Wrote state {:?}", path);
        Ok(())
    }

    /// Store `contents` under `key` only if nothing is stored yet.
    ///
    /// Returns `true` when this call created the value.
    pub fn write_if_absent(&self, key: &str, contents: &str) -> Result<bool, StateError> {
        self.ensure_root()?;
        let path = self.path_of(key);
        match write_restricted(&path, contents, true) {
            Ok(()) => {
                debug!("Seeded state {:?}", path);
                Ok(true)
            }
            Err(StateError::Io { source, .. }) if source.kind() == ErrorKind::AlreadyExists => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Decode the JSON value stored under `key`.
    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        let Some(raw) = self.read(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StateError::Json {
                path: self.path_of(key),
                source,
            })
    }

    /// Encode `value` as JSON and store it under `key`.
    pub fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StateError> {
        let raw = self.encode_json(key, value)?;
        self.write(key, &raw)
    }

    /// Encode `value` as JSON and store it under `key` only if nothing is stored yet.
    pub fn write_json_if_absent<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<bool, StateError> {
        let raw = self.encode_json(key, value)?;
        self.write_if_absent(key, &raw)
    }

    /// Remove the value stored under `key`. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> Result<bool, StateError> {
        let path = self.path_of(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StateError::Io { path, source }),
        }
    }

    fn encode_json<T: Serialize>(&self, key: &str, value: &T) -> Result<String, StateError> {
        serde_json::to_string_pretty(value).map_err(|source| StateError::Json {
            path: self.path_of(key),
            source,
        })
    }

    fn ensure_root(&self) -> Result<(), StateError> {
        fs::create_dir_all(&self.root).map_err(|source| StateError::Io {
            path: self.root.clone(),
            source,
        })
    }
}

impl Default for TempStore {
    fn default() -> Self {
        Self::default_location()
    }
}

/// Write a file readable only by the owner.
fn write_restricted(path: &Path, contents: &str, exclusive: bool) -> Result<(), StateError> {
    let mut options = OpenOptions::new();
    options.write(true);
    if exclusive {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    #[cfg(unix)]
    options.mode(0o600);

    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(contents.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = TempStore::new(dir.path());
        assert_eq!(store.read("nothing").unwrap(), None);
        assert!(!store.exists("nothing"));
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let store = TempStore::new(dir.path().join("nested"));

        store.write(CA_CERT_KEY, "pem").unwrap();
        assert!(store.exists(CA_CERT_KEY));
        assert_eq!(store.read(CA_CERT_KEY).unwrap().as_deref(), Some("pem"));

        store.write(CA_CERT_KEY, "replaced").unwrap();
        assert_eq!(store.read(CA_CERT_KEY).unwrap().as_deref(), Some("replaced"));
    }

    #[test]
    fn test_write_leaves_no_staging_files() {
        let dir = tempdir().unwrap();
        let store = TempStore::new(dir.path());
        store.write("a", "1").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("a")]);
    }

    #[test]
    fn test_write_if_absent_keeps_first_value() {
        let dir = tempdir().unwrap();
        let store = TempStore::new(dir.path());

        assert!(store.write_if_absent("k", "first").unwrap());
        assert!(!store.write_if_absent("k", "second").unwrap());
        assert_eq!(store.read("k").unwrap().as_deref(), Some("first"));
    }

    #[test]
    fn test_json_roundtrip_and_delete() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Snapshot {
            enabled: bool,
            server: String,
        }

        let dir = tempdir().unwrap();
        let store = TempStore::new(dir.path());
        let snapshot = Snapshot {
            enabled: true,
            server: "127.0.0.1:8888".to_string(),
        };

        store.write_json(PROXY_SNAPSHOT_KEY, &snapshot).unwrap();
        let loaded: Option<Snapshot> = store.read_json(PROXY_SNAPSHOT_KEY).unwrap();
        assert_eq!(loaded, Some(snapshot));

        assert!(store.delete(PROXY_SNAPSHOT_KEY).unwrap());
        assert!(!store.delete(PROXY_SNAPSHOT_KEY).unwrap());
    }

    #[test]
    fn test_read_json_rejects_garbage() {
        let dir = tempdir().unwrap();
        let store = TempStore::new(dir.path());
        store.write("bad.json", "{not json").unwrap();

        let result: Result<Option<serde_json::Value>, _> = store.read_json("bad.json");
        assert!(matches!(result, Err(StateError::Json { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = TempStore::new(dir.path());
        store.write(CA_KEY_KEY, "secret").unwrap();

        let mode = fs::metadata(store.path_of(CA_KEY_KEY))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
