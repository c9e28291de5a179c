//! Marker files recording which pairs of users already share a chat.
//!
//! A marker is an empty file named `<first>:<second>` with the two names in
//! lexicographic order. Only its existence matters.

use std::path::PathBuf;

use crate::credentials::SEPARATOR;

pub struct ChatDirectory {
    dir: PathBuf,
}

impl ChatDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn marker_path(&self, a: &str, b: &str) -> PathBuf {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        self.dir.join(format!("{first}{SEPARATOR}{second}"))
    }

    /// Whether `a` and `b` already share a chat. An error means the answer is
    /// unknown, not that the chat is missing.
    pub async fn exists(&self, a: &str, b: &str) -> std::io::Result<bool> {
        tokio::fs::try_exists(self.marker_path(a, b)).await
    }

    /// Creates the marker for `a` and `b`, and the directory if needed. An
    /// existing marker is left as it is.
    pub async fn create(&self, a: &str, b: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.marker_path(a, b);
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_name_is_order_independent() {
        let chats = ChatDirectory::new("/data/chats");
        assert_eq!(chats.marker_path("bob", "alice"), PathBuf::from("/data/chats/alice:bob"));
        assert_eq!(chats.marker_path("alice", "bob"), chats.marker_path("bob", "alice"));
    }

    #[tokio::test]
    async fn test_create_makes_directory_and_empty_file() {
        let temp = TempDir::new().unwrap();
        let chats = ChatDirectory::new(temp.path().join("chats"));

        assert!(!chats.exists("alice", "bob").await.unwrap());
        let path = chats.create("bob", "alice").await.unwrap();

        assert!(chats.exists("alice", "bob").await.unwrap());
        assert_eq!(tokio::fs::metadata(path).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_create_keeps_existing_marker() {
        let temp = TempDir::new().unwrap();
        let chats = ChatDirectory::new(temp.path().join("chats"));
        let path = chats.create("alice", "bob").await.unwrap();
        tokio::fs::write(&path, b"history").await.unwrap();

        chats.create("bob", "alice").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"history");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exists_reports_lookup_errors() {
        let temp = TempDir::new().unwrap();
        // A regular file where the directory should be makes every lookup
        // below it fail with ENOTDIR.
        let dir = temp.path().join("chats");
        tokio::fs::write(&dir, b"").await.unwrap();
        let chats = ChatDirectory::new(&dir);

        assert!(chats.exists("alice", "bob").await.is_err());
    }
}
