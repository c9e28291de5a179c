use tracing::info;

use crate::chats::ChatDirectory;
use crate::config::ServerConfig;
use crate::credentials::{CredentialStore, StoreError};
use crate::ledger::ChatRequestLedger;
use crate::session::{ConnectionId, SessionRegistry};

/// Everything the server's tasks share. Each table guards itself, and no
/// method here holds two of their locks at once.
pub struct ServerState {
    pub config: ServerConfig,
    pub credentials: CredentialStore,
    pub sessions: SessionRegistry,
    pub requests: ChatRequestLedger,
    pub chats: ChatDirectory,
}

impl ServerState {
    pub async fn load(config: ServerConfig) -> Result<Self, StoreError> {
        let credentials = CredentialStore::load(config.shadow_path()).await?;
        Ok(Self {
            sessions: SessionRegistry::new(config.write_timeout),
            requests: ChatRequestLedger::new(),
            chats: ChatDirectory::new(config.chat_dir()),
            credentials,
            config,
        })
    }

    /// Forgets a closed connection and withdraws the requests of the user it
    /// was logged in as. Runs on the message processor, or after it stopped.
    pub async fn depart(&self, conn: &ConnectionId) {
        if let Some(username) = self.sessions.detach(conn).await {
            info!(%conn, user = %username, "logged-in user disconnected");
            self.release_user(&username).await;
        }
    }

    /// Withdraws the pending requests of a user who logged out or
    /// disconnected, telling whoever is still online.
    pub async fn release_user(&self, username: &str) {
        let withdrawn = self.requests.withdraw_user(username).await;
        if withdrawn.is_empty() {
            return;
        }

        let sessions = self.sessions.lock().await;
        for request in withdrawn {
            info!(
                recipient = %request.recipient,
                initiator = %request.initiator,
                "withdrawing chat request of departed user"
            );
            if request.recipient == username {
                sessions.deliver_to_user(
                    &request.initiator,
                    &format!(
                        "Your chat request to {} was withdrawn because {} went offline.",
                        request.recipient, request.recipient
                    ),
                );
            } else {
                sessions.deliver_to_user(
                    &request.recipient,
                    &format!(
                        "The chat request from {} was withdrawn because {} went offline.",
                        request.initiator, request.initiator
                    ),
                );
            }
        }
    }
}
