//! Executes client commands against the shared state.
//!
//! Every rejected command answers the sender with exactly one `[Error]`
//! reply and leaves the state untouched.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::commands::{Command, help_text};
use crate::credentials::{RegisterError, VerifyError};
use crate::session::{ConnectionId, LoginError};
use crate::state::ServerState;

pub const INVALID_CREDENTIALS: &str = "[Error] Invalid combination of username and password given.";
pub const NO_PENDING_REQUEST: &str = "There is no pending request.";
pub const CHAT_CREATED: &str = "Successfully created new chat.";
pub const CHAT_LOOKUP_FAILED: &str =
    "[Error] Chat request aborted. An error occurred while checking existing chats.";

#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<ServerState>,
}

impl Dispatcher {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Parses and runs one command payload from `conn`.
    pub async fn dispatch(&self, conn: ConnectionId, payload: &str) {
        let command = match Command::parse(payload) {
            Ok(command) => command,
            Err(e) => {
                info!(%conn, error = %e, "rejected command");
                self.reply(&conn, &format!("[Error] {e}")).await;
                return;
            }
        };

        debug!(%conn, command = %command.kind(), "handling command");
        match command {
            Command::Help => self.reply(&conn, &help_text()).await,
            Command::Quit => self.handle_quit(conn).await,
            Command::Register { username, hash } => self.handle_register(conn, &username, &hash).await,
            Command::Login { username, hash } => self.handle_login(conn, &username, &hash).await,
            Command::Logout => self.handle_logout(conn).await,
            Command::NewChat { recipient } => self.handle_new_chat(conn, &recipient).await,
            Command::Accept => self.handle_accept(conn).await,
            Command::Decline => self.handle_decline(conn).await,
        }
    }

    /// Cleans up after a connection whose reader has stopped.
    pub async fn depart(&self, conn: ConnectionId) {
        self.state.depart(&conn).await;
    }

    async fn reply(&self, conn: &ConnectionId, text: &str) {
        self.state.sessions.send_to(conn, text).await;
    }

    async fn handle_quit(&self, conn: ConnectionId) {
        if self.state.sessions.cancel(&conn).await {
            info!(%conn, "client asked to quit");
        }
    }

    async fn handle_register(&self, conn: ConnectionId, username: &str, hash: &str) {
        match self.state.credentials.register(username, hash).await {
            Ok(()) => {
                info!(%conn, user = username, "registered new user");
                self.reply(&conn, &format!("New user added: {username}")).await;
            }
            Err(RegisterError::Duplicate(_)) => {
                info!(%conn, user = username, "registration rejected: duplicate username");
                self.reply(
                    &conn,
                    "[Error] Username already exists. Please retry with a different username.",
                )
                .await;
            }
            Err(RegisterError::InvalidUsername(_)) => {
                info!(%conn, user = username, "registration rejected: invalid username");
                self.reply(
                    &conn,
                    "[Error] Invalid username. Usernames must not be empty or contain ':', '/', '\\' or whitespace.",
                )
                .await;
            }
        }
    }

    async fn handle_login(&self, conn: ConnectionId, username: &str, hash: &str) {
        let sessions = &self.state.sessions;

        // Session conflicts are reported before the password is looked at.
        if let Err(e) = sessions.check_login(&conn, username).await {
            self.reject_login(conn, username, e).await;
            return;
        }

        if let Err(e) = self.state.credentials.verify(username, hash).await {
            match e {
                VerifyError::UnknownUser => info!(%conn, user = username, "login failed: unknown user"),
                VerifyError::WrongHash => info!(%conn, user = username, "login failed: wrong password hash"),
            }

            let attempts = sessions.record_failed_login(&conn).await;
            let max = self.state.config.max_login_attempts;
            if max > 0 && attempts >= max {
                info!(%conn, attempts, "too many failed logins, closing connection");
                self.reply(&conn, "[Error] Too many failed login attempts. Closing connection.")
                    .await;
                sessions.cancel(&conn).await;
            } else {
                self.reply(&conn, INVALID_CREDENTIALS).await;
            }
            return;
        }

        match sessions.login(&conn, username).await {
            Ok(()) => {
                info!(%conn, user = username, "login successful");
                self.reply(&conn, "Login successful.").await;
            }
            Err(e) => self.reject_login(conn, username, e).await,
        }
    }

    async fn reject_login(&self, conn: ConnectionId, username: &str, error: LoginError) {
        info!(%conn, user = username, %error, "login rejected");
        let text = match error {
            LoginError::AlreadyLoggedIn(current) => format!(
                "[Error] Login failed because you are already logged in as '{current}'. \
                 Please log out first in order to log in as another user."
            ),
            LoginError::UsernameTaken(_) => {
                "[Error] Login failed because user is already logged in.".to_string()
            }
            LoginError::UnknownConnection => return,
        };
        self.reply(&conn, &text).await;
    }

    async fn handle_logout(&self, conn: ConnectionId) {
        match self.state.sessions.logout(&conn).await {
            Some(username) => {
                info!(%conn, user = %username, "logged out");
                self.state.release_user(&username).await;
                self.reply(&conn, "Logout successful.").await;
            }
            None => self.reply(&conn, "[Error] You are not logged in.").await,
        }
    }

    async fn handle_new_chat(&self, conn: ConnectionId, recipient: &str) {
        let state = &self.state;

        if !state.credentials.contains(recipient).await {
            info!(%conn, recipient, "chat request aborted: recipient not registered");
            self.reply(
                &conn,
                &format!("[Error] Chat request aborted. {recipient} is no registered user."),
            )
            .await;
            return;
        }

        let Some(initiator) = state.sessions.lookup_username(&conn).await else {
            info!(%conn, recipient, "chat request aborted: initiator not logged in");
            self.reply(&conn, "[Error] Chat request aborted as you are not logged in as a user.")
                .await;
            return;
        };

        if initiator == recipient {
            self.reply(&conn, "[Error] Chat request aborted. You cannot start a chat with yourself.")
                .await;
            return;
        }

        if state.sessions.lookup_connection(recipient).await.is_none() {
            info!(%conn, user = %initiator, recipient, "chat request aborted: recipient offline");
            self.reply(
                &conn,
                &format!(
                    "[Error] Chat request aborted. {recipient} is currently offline. Please try again later."
                ),
            )
            .await;
            return;
        }

        match state.chats.exists(&initiator, recipient).await {
            Ok(false) => {}
            Ok(true) => {
                info!(%conn, user = %initiator, recipient, "chat request aborted: chat exists");
                self.reply(&conn, "[Error] Chat request aborted. This chat already exists.")
                    .await;
                return;
            }
            Err(e) => {
                warn!(%conn, user = %initiator, recipient, error = %e, "failed to look up chat marker");
                self.reply(&conn, CHAT_LOOKUP_FAILED).await;
                return;
            }
        }

        if let Err(busy) = state.requests.open(recipient, &initiator).await {
            info!(%conn, user = %initiator, error = %busy, "chat request aborted: recipient busy");
            self.reply(
                &conn,
                &format!("[Error] Chat request aborted. {recipient} already has a pending request."),
            )
            .await;
            return;
        }

        info!(user = %initiator, recipient, "chat request opened");
        let sessions = state.sessions.lock().await;
        sessions.deliver_to_user(
            recipient,
            &format!(
                "You have received a chat request from {initiator}. \
                 Use '/accept' to accept that request or '/decline' to deny it."
            ),
        );
        sessions.deliver(&conn, &format!("Chat request sent to {recipient}."));
    }

    async fn handle_accept(&self, conn: ConnectionId) {
        let Some((acceptor, initiator)) = self.take_pending(conn, "/accept").await else {
            return;
        };

        self.state
            .sessions
            .lock()
            .await
            .deliver_to_user(&initiator, &format!("{acceptor} accepted your request."));

        // The request is consumed whether or not the marker can be written.
        let outcome = match self.state.chats.create(&initiator, &acceptor).await {
            Ok(path) => {
                info!(path = %path.display(), "created new chat");
                CHAT_CREATED.to_string()
            }
            Err(e) => {
                error!(user = %acceptor, other = %initiator, error = %e, "failed to create chat marker");
                "[Error] An error occurred while creating the new chat.".to_string()
            }
        };

        let sessions = self.state.sessions.lock().await;
        sessions.deliver(&conn, &outcome);
        sessions.deliver_to_user(&initiator, &outcome);
    }

    async fn handle_decline(&self, conn: ConnectionId) {
        let Some((decliner, initiator)) = self.take_pending(conn, "/decline").await else {
            return;
        };

        info!(user = %decliner, initiator = %initiator, "chat request declined");
        let sessions = self.state.sessions.lock().await;
        sessions.deliver_to_user(&initiator, &format!("{decliner} declined your request."));
        sessions.deliver(&conn, &format!("You declined the chat request from {initiator}."));
    }

    /// Removes the request pending for the sender, answering "no pending
    /// request" when there is none. Returns `(recipient, initiator)`.
    async fn take_pending(&self, conn: ConnectionId, command: &str) -> Option<(String, String)> {
        let pending = match self.state.sessions.lookup_username(&conn).await {
            Some(recipient) => self
                .state
                .requests
                .take(&recipient)
                .await
                .map(|initiator| (recipient, initiator)),
            None => None,
        };

        if pending.is_none() {
            info!(%conn, command, "no pending request");
            self.reply(
                &conn,
                &format!("[Error] '{command}' command aborted. {NO_PENDING_REQUEST}"),
            )
            .await;
        }
        pending
    }
}
