//! Persisted username → password-hash table (the "shadow file").
//!
//! The file holds one `username:hash` record per line. It is read once at
//! startup and rewritten atomically on shutdown; in between, the in-memory
//! map is the source of truth.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Username reserved for unauthenticated connections.
pub const ANONYMOUS: &str = "anonymous";

/// Separates username and hash in the shadow file and usernames in chat
/// marker names, so it may never appear in a username.
pub const SEPARATOR: char = ':';

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to move {from} over {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("username '{0}' already exists")]
    Duplicate(String),
    #[error("username '{0}' is not allowed")]
    InvalidUsername(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("unknown user")]
    UnknownUser,
    #[error("wrong password hash")]
    WrongHash,
}

/// Rejects names that would break the shadow file or a marker path.
/// The reserved anonymous name is not checked here; it is a duplicate.
pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username != "."
        && username != ".."
        && !username.contains([SEPARATOR, '/', '\\'])
        && !username.chars().any(char::is_whitespace)
}

pub struct CredentialStore {
    path: PathBuf,
    users: Mutex<HashMap<String, String>>,
}

impl CredentialStore {
    /// Loads the shadow file at `path`, creating it (and its directory) when
    /// missing. Malformed lines are skipped.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Self::create_empty(&path).await?;
                info!(path = %path.display(), "no shadow file yet, created an empty one");
                String::new()
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        let users = parse_shadow(&contents);
        info!(path = %path.display(), users = users.len(), "loaded shadow file");

        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    async fn create_empty(path: &Path) -> Result<(), StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::File::create(path)
            .await
            .map_err(|source| StoreError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(())
    }

    /// Writes every record to a temporary sibling file, then renames it over
    /// the shadow file so a crash never leaves a half-written table behind.
    pub async fn save(&self) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("tmp");

        let contents = {
            let users = self.users.lock().await;
            let mut contents = String::new();
            for (username, hash) in users.iter() {
                contents.push_str(username);
                contents.push(SEPARATOR);
                contents.push_str(hash);
                contents.push('\n');
            }
            contents
        };

        debug!(path = %tmp_path.display(), "writing temporary shadow file");
        let write_err = |source: std::io::Error| StoreError::Write {
            path: tmp_path.clone(),
            source,
        };
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(write_err)?;
        file.write_all(contents.as_bytes()).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| StoreError::Rename {
                from: tmp_path.clone(),
                to: self.path.clone(),
                source,
            })?;

        info!(path = %self.path.display(), "saved shadow file");
        Ok(())
    }

    pub async fn register(&self, username: &str, hash: &str) -> Result<(), RegisterError> {
        if username == ANONYMOUS {
            return Err(RegisterError::Duplicate(username.to_string()));
        }
        if !is_valid_username(username) {
            return Err(RegisterError::InvalidUsername(username.to_string()));
        }

        let mut users = self.users.lock().await;
        if users.contains_key(username) {
            return Err(RegisterError::Duplicate(username.to_string()));
        }
        users.insert(username.to_string(), hash.to_string());
        Ok(())
    }

    pub async fn verify(&self, username: &str, hash: &str) -> Result<(), VerifyError> {
        let users = self.users.lock().await;
        match users.get(username) {
            None => Err(VerifyError::UnknownUser),
            Some(stored) if stored != hash => Err(VerifyError::WrongHash),
            Some(_) => Ok(()),
        }
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.users.lock().await.contains_key(username)
    }

    pub async fn len(&self) -> usize {
        self.users.lock().await.len()
    }
}

fn parse_shadow(contents: &str) -> HashMap<String, String> {
    let mut users = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(SEPARATOR) {
            Some((username, hash)) if !username.is_empty() => {
                users.insert(username.to_string(), hash.to_string());
            }
            _ => warn!(line, "skipping malformed shadow file entry"),
        }
    }
    users
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_creates_missing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("shadow");

        let store = CredentialStore::load(&path).await.unwrap();

        assert_eq!(store.len().await, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_load_skips_blank_and_malformed_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("shadow");
        tokio::fs::write(&path, "alice:abc\n\n  \nbroken-line\nbob:def:ghi\n")
            .await
            .unwrap();

        let store = CredentialStore::load(&path).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(store.verify("alice", "abc").await, Ok(()));
        assert_eq!(store.verify("bob", "def:ghi").await, Ok(()));
    }

    #[tokio::test]
    async fn test_load_fails_when_path_is_a_directory() {
        let temp = TempDir::new().unwrap();
        let result = CredentialStore::load(temp.path()).await;
        assert!(matches!(result, Err(StoreError::Read { .. })));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_anonymous() {
        let temp = TempDir::new().unwrap();
        let store = CredentialStore::load(temp.path().join("shadow")).await.unwrap();

        assert_eq!(store.register("alice", "h1").await, Ok(()));
        assert_eq!(
            store.register("alice", "h2").await,
            Err(RegisterError::Duplicate("alice".into()))
        );
        assert_eq!(
            store.register(ANONYMOUS, "h").await,
            Err(RegisterError::Duplicate(ANONYMOUS.into()))
        );
        assert_eq!(store.verify("alice", "h1").await, Ok(()));
    }

    #[tokio::test]
    async fn test_register_rejects_unsafe_names() {
        let temp = TempDir::new().unwrap();
        let store = CredentialStore::load(temp.path().join("shadow")).await.unwrap();

        for name in ["", "a:b", "../x", "a/b", "a\\b", ".", ".."] {
            assert!(
                matches!(store.register(name, "h").await, Err(RegisterError::InvalidUsername(_))),
                "{name:?} should be rejected"
            );
        }
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_verify_distinguishes_failures() {
        let temp = TempDir::new().unwrap();
        let store = CredentialStore::load(temp.path().join("shadow")).await.unwrap();
        store.register("alice", "h1").await.unwrap();

        assert_eq!(store.verify("bob", "h1").await, Err(VerifyError::UnknownUser));
        assert_eq!(store.verify("alice", "nope").await, Err(VerifyError::WrongHash));
    }

    #[tokio::test]
    async fn test_save_round_trip() {
        for count in [0usize, 1, 50] {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("shadow");

            let store = CredentialStore::load(&path).await.unwrap();
            for i in 0..count {
                store.register(&format!("user{i}"), &format!("hash{i}")).await.unwrap();
            }
            store.save().await.unwrap();

            let reloaded = CredentialStore::load(&path).await.unwrap();
            assert_eq!(*reloaded.users.lock().await, *store.users.lock().await);
            assert!(!path.with_extension("tmp").exists());
        }
    }

    #[tokio::test]
    async fn test_save_fails_when_directory_vanished() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("data");
        let store = CredentialStore::load(dir.join("shadow")).await.unwrap();
        tokio::fs::remove_dir_all(&dir).await.unwrap();

        assert!(matches!(store.save().await, Err(StoreError::Write { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_lose_nothing() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::load(temp.path().join("shadow")).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..200 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.register(&format!("user{i}"), "hash").await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
        assert_eq!(store.len().await, 200);

        let mut dupes = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            dupes.push(tokio::spawn(async move { store.register("fresh", "hash").await }));
        }
        let mut ok = 0;
        for handle in dupes {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(e) => assert_eq!(e, RegisterError::Duplicate("fresh".into())),
            }
        }
        assert_eq!(ok, 1);
    }
}
