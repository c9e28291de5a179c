//! Live connections and who they are logged in as.
//!
//! All state sits behind one lock. Nothing in here touches a socket: replies
//! are pushed onto each connection's outbound queue and written by that
//! connection's writer task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::credentials::ANONYMOUS;
use crate::messages::Packet;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginError {
    #[error("connection is already logged in as '{0}'")]
    AlreadyLoggedIn(String),
    #[error("user '{0}' is already logged in elsewhere")]
    UsernameTaken(String),
    #[error("connection is not registered")]
    UnknownConnection,
}

struct Session {
    addr: SocketAddr,
    username: Option<String>,
    outbound: mpsc::Sender<Packet>,
    cancel: CancellationToken,
    failed_logins: u32,
}

/// The registry's state while its lock is held.
#[derive(Default)]
pub struct Sessions {
    by_conn: HashMap<ConnectionId, Session>,
    by_user: HashMap<String, ConnectionId>,
}

impl Sessions {
    pub fn username(&self, conn: &ConnectionId) -> Option<&str> {
        self.by_conn.get(conn)?.username.as_deref()
    }

    pub fn connection(&self, username: &str) -> Option<ConnectionId> {
        self.by_user.get(username).copied()
    }

    /// Queues `text` for `conn` without waiting. Use this when the registry
    /// lock is already held; a full queue drops the reply.
    pub fn deliver(&self, conn: &ConnectionId, text: &str) {
        let Some(session) = self.by_conn.get(conn) else {
            debug!(%conn, "dropping reply for detached connection");
            return;
        };
        match session.outbound.try_send(personalize(session, text)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%conn, addr = %session.addr, "outbound queue full, dropping reply");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%conn, "writer already gone, dropping reply");
            }
        }
    }

    pub fn deliver_to_user(&self, username: &str, text: &str) {
        if let Some(conn) = self.connection(username) {
            self.deliver(&conn, text);
        }
    }
}

fn personalize(session: &Session, text: &str) -> Packet {
    let name = session.username.as_deref().unwrap_or(ANONYMOUS);
    Packet::message(format!("({name}) {text}"))
}

pub struct SessionRegistry {
    inner: Mutex<Sessions>,
    write_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Sessions::default()),
            write_timeout,
        }
    }

    /// Takes the registry lock. Callers must not perform network I/O while
    /// holding the guard.
    pub async fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock().await
    }

    /// Registers a fresh, anonymous connection. `cancel` is the token the
    /// connection's handler watches; raising it closes the connection.
    pub async fn attach(
        &self,
        conn: ConnectionId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Packet>,
        cancel: CancellationToken,
    ) {
        let mut sessions = self.inner.lock().await;
        let previous = sessions.by_conn.insert(
            conn,
            Session {
                addr,
                username: None,
                outbound,
                cancel,
                failed_logins: 0,
            },
        );
        debug_assert!(previous.is_none(), "connection {conn} attached twice");
    }

    /// Removes every trace of `conn` and returns the username it was logged
    /// in as, if any.
    pub async fn detach(&self, conn: &ConnectionId) -> Option<String> {
        let mut sessions = self.inner.lock().await;
        let session = sessions.by_conn.remove(conn)?;
        let username = session.username?;
        sessions.by_user.remove(&username);
        Some(username)
    }

    /// Authoritative login: both checks and both map updates happen under a
    /// single lock acquisition.
    pub async fn login(&self, conn: &ConnectionId, username: &str) -> Result<(), LoginError> {
        let mut sessions = self.inner.lock().await;
        Self::check_login_locked(&sessions, conn, username)?;

        let session = sessions
            .by_conn
            .get_mut(conn)
            .ok_or(LoginError::UnknownConnection)?;
        session.username = Some(username.to_string());
        session.failed_logins = 0;
        sessions.by_user.insert(username.to_string(), *conn);
        Ok(())
    }

    /// The same checks as [`login`](Self::login) without changing anything,
    /// so session errors can be reported before credentials are checked.
    pub async fn check_login(&self, conn: &ConnectionId, username: &str) -> Result<(), LoginError> {
        let sessions = self.inner.lock().await;
        Self::check_login_locked(&sessions, conn, username)
    }

    fn check_login_locked(
        sessions: &Sessions,
        conn: &ConnectionId,
        username: &str,
    ) -> Result<(), LoginError> {
        let session = sessions
            .by_conn
            .get(conn)
            .ok_or(LoginError::UnknownConnection)?;
        if let Some(current) = &session.username {
            return Err(LoginError::AlreadyLoggedIn(current.clone()));
        }
        if sessions.by_user.contains_key(username) {
            return Err(LoginError::UsernameTaken(username.to_string()));
        }
        Ok(())
    }

    /// Resets `conn` to anonymous and returns the name it had.
    pub async fn logout(&self, conn: &ConnectionId) -> Option<String> {
        let mut sessions = self.inner.lock().await;
        let username = sessions.by_conn.get_mut(conn)?.username.take()?;
        sessions.by_user.remove(&username);
        Some(username)
    }

    /// Counts a failed login and returns the running total.
    pub async fn record_failed_login(&self, conn: &ConnectionId) -> u32 {
        let mut sessions = self.inner.lock().await;
        match sessions.by_conn.get_mut(conn) {
            Some(session) => {
                session.failed_logins += 1;
                session.failed_logins
            }
            None => 0,
        }
    }

    pub async fn lookup_username(&self, conn: &ConnectionId) -> Option<String> {
        self.inner.lock().await.username(conn).map(str::to_string)
    }

    pub async fn lookup_connection(&self, username: &str) -> Option<ConnectionId> {
        self.inner.lock().await.connection(username)
    }

    /// Raises the connection's cancellation signal. Returns false if the
    /// connection is unknown.
    pub async fn cancel(&self, conn: &ConnectionId) -> bool {
        match self.inner.lock().await.by_conn.get(conn) {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_conn.len()
    }

    /// Queues `text` for `conn`, waiting up to the write timeout for room in
    /// its queue. The lock is released before waiting.
    pub async fn send_to(&self, conn: &ConnectionId, text: &str) {
        let (outbound, packet) = {
            let sessions = self.inner.lock().await;
            let Some(session) = sessions.by_conn.get(conn) else {
                debug!(%conn, "dropping reply for detached connection");
                return;
            };
            (session.outbound.clone(), personalize(session, text))
        };

        match outbound.send_timeout(packet, self.write_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(%conn, "timed out queueing reply, dropping it");
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!(%conn, "writer already gone, dropping reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    async fn attach(registry: &SessionRegistry) -> (ConnectionId, mpsc::Receiver<Packet>, CancellationToken) {
        let conn = ConnectionId::new_v4();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        registry.attach(conn, addr(), tx, cancel.clone()).await;
        (conn, rx, cancel)
    }

    #[tokio::test]
    async fn test_attach_is_anonymous() {
        let registry = SessionRegistry::new(Duration::from_secs(1));
        let (conn, _rx, _) = attach(&registry).await;

        assert_eq!(registry.lookup_username(&conn).await, None);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_login_logout_cycle() {
        let registry = SessionRegistry::new(Duration::from_secs(1));
        let (conn, _rx, _) = attach(&registry).await;

        registry.login(&conn, "alice").await.unwrap();
        assert_eq!(registry.lookup_username(&conn).await.as_deref(), Some("alice"));
        assert_eq!(registry.lookup_connection("alice").await, Some(conn));

        assert_eq!(
            registry.login(&conn, "bob").await,
            Err(LoginError::AlreadyLoggedIn("alice".into()))
        );

        assert_eq!(registry.logout(&conn).await.as_deref(), Some("alice"));
        assert_eq!(registry.lookup_connection("alice").await, None);
        assert_eq!(registry.logout(&conn).await, None);
    }

    #[tokio::test]
    async fn test_username_taken() {
        let registry = SessionRegistry::new(Duration::from_secs(1));
        let (a, _rx_a, _) = attach(&registry).await;
        let (b, _rx_b, _) = attach(&registry).await;

        registry.login(&a, "alice").await.unwrap();
        assert_eq!(
            registry.check_login(&b, "alice").await,
            Err(LoginError::UsernameTaken("alice".into()))
        );
        assert_eq!(
            registry.login(&b, "alice").await,
            Err(LoginError::UsernameTaken("alice".into()))
        );
    }

    #[tokio::test]
    async fn test_detach_frees_username() {
        let registry = SessionRegistry::new(Duration::from_secs(1));
        let (a, _rx, _) = attach(&registry).await;
        registry.login(&a, "alice").await.unwrap();

        assert_eq!(registry.detach(&a).await.as_deref(), Some("alice"));
        assert_eq!(registry.len().await, 0);
        assert_eq!(registry.lookup_connection("alice").await, None);

        let (b, _rx, _) = attach(&registry).await;
        registry.login(&b, "alice").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_logins_single_winner() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(1)));
        let mut conns = Vec::new();
        for _ in 0..32 {
            let (conn, rx, _) = attach(&registry).await;
            conns.push((conn, rx));
        }

        let mut handles = Vec::new();
        for (conn, _) in &conns {
            let registry = Arc::clone(&registry);
            let conn = *conn;
            handles.push(tokio::spawn(async move { registry.login(&conn, "alice").await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_replies_are_personalized() {
        let registry = SessionRegistry::new(Duration::from_secs(1));
        let (conn, mut rx, _) = attach(&registry).await;

        registry.send_to(&conn, "hello").await;
        assert_eq!(rx.recv().await.unwrap().payload, "(anonymous) hello");

        registry.login(&conn, "alice").await.unwrap();
        registry.lock().await.deliver(&conn, "welcome");
        assert_eq!(rx.recv().await.unwrap().payload, "(alice) welcome");

        registry.lock().await.deliver_to_user("alice", "again");
        assert_eq!(rx.recv().await.unwrap().payload, "(alice) again");
    }

    #[tokio::test]
    async fn test_cancel_raises_token() {
        let registry = SessionRegistry::new(Duration::from_secs(1));
        let (conn, _rx, token) = attach(&registry).await;

        assert!(registry.cancel(&conn).await);
        assert!(token.is_cancelled());
        assert!(!registry.cancel(&ConnectionId::new_v4()).await);
    }

    #[tokio::test]
    async fn test_failed_logins_reset_on_success() {
        let registry = SessionRegistry::new(Duration::from_secs(1));
        let (conn, _rx, _) = attach(&registry).await;

        assert_eq!(registry.record_failed_login(&conn).await, 1);
        assert_eq!(registry.record_failed_login(&conn).await, 2);
        registry.login(&conn, "alice").await.unwrap();
        registry.logout(&conn).await;
        assert_eq!(registry.record_failed_login(&conn).await, 1);
    }
}
