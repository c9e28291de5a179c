//! Pending chat invitations, keyed by the invited user.

use std::collections::HashMap;

use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{recipient} already has a pending request from {initiator}")]
pub struct RecipientBusy {
    pub recipient: String,
    pub initiator: String,
}

/// A request that was dropped because one of its parties went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawn {
    pub recipient: String,
    pub initiator: String,
}

#[derive(Default)]
pub struct ChatRequestLedger {
    requests: Mutex<HashMap<String, String>>,
}

impl ChatRequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `initiator → recipient` unless the recipient already has a
    /// pending request.
    pub async fn open(&self, recipient: &str, initiator: &str) -> Result<(), RecipientBusy> {
        let mut requests = self.requests.lock().await;
        if let Some(existing) = requests.get(recipient) {
            return Err(RecipientBusy {
                recipient: recipient.to_string(),
                initiator: existing.clone(),
            });
        }
        requests.insert(recipient.to_string(), initiator.to_string());
        Ok(())
    }

    /// Resolves the request pending for `recipient`, returning its initiator.
    /// Accept and decline both go through here, so each request resolves once.
    pub async fn take(&self, recipient: &str) -> Option<String> {
        self.requests.lock().await.remove(recipient)
    }

    #[cfg(test)]
    pub async fn pending_for(&self, recipient: &str) -> Option<String> {
        self.requests.lock().await.get(recipient).cloned()
    }

    /// Drops every request `username` takes part in, on either side.
    pub async fn withdraw_user(&self, username: &str) -> Vec<Withdrawn> {
        let mut requests = self.requests.lock().await;
        let mut withdrawn = Vec::new();
        requests.retain(|recipient, initiator| {
            let involved = recipient == username || initiator == username;
            if involved {
                withdrawn.push(Withdrawn {
                    recipient: recipient.clone(),
                    initiator: initiator.clone(),
                });
            }
            !involved
        });
        withdrawn
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.requests.lock().await.len()
    }
}
