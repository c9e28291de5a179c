//! The command surface clients can invoke.

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Help,
    Quit,
    Register,
    Login,
    Logout,
    NewChat,
    Accept,
    Decline,
}

impl CommandKind {
    pub const ALL: [CommandKind; 8] = [
        CommandKind::Help,
        CommandKind::Quit,
        CommandKind::Register,
        CommandKind::Login,
        CommandKind::Logout,
        CommandKind::NewChat,
        CommandKind::Accept,
        CommandKind::Decline,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Help => "/help",
            CommandKind::Quit => "/quit",
            CommandKind::Register => "/register",
            CommandKind::Login => "/login",
            CommandKind::Logout => "/logout",
            CommandKind::NewChat => "/newChat",
            CommandKind::Accept => "/accept",
            CommandKind::Decline => "/decline",
        }
    }

    /// Exact number of arguments after the command name.
    pub fn arity(self) -> usize {
        match self {
            CommandKind::Register | CommandKind::Login => 2,
            CommandKind::NewChat => 1,
            _ => 0,
        }
    }

    pub fn usage(self) -> &'static str {
        match self {
            CommandKind::Register => "/register <username> <password>",
            CommandKind::Login => "/login <username> <password>",
            CommandKind::NewChat => "/newChat <username>",
            other => other.name(),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            CommandKind::Help => "Lists all the available commands with a description.",
            CommandKind::Quit => "Signals the server to close the connection.",
            CommandKind::Register => {
                "Sends username and locally hashed password to the server to set up a new user. \
                 Fails if the username is already in use."
            }
            CommandKind::Login => {
                "Sends username and locally hashed password to the server to log in. \
                 Too many failed attempts close the connection."
            }
            CommandKind::Logout => "Logs you out of the account you are currently logged in as.",
            CommandKind::NewChat => {
                "Sends a request to start a new chat to the given user. \
                 Only works if the user is online and the chat doesn't exist yet."
            }
            CommandKind::Accept => "Accepts an incoming request to start a new chat.",
            CommandKind::Decline => "Declines an incoming request to start a new chat.",
        }
    }
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The full `/help` reply.
pub fn help_text() -> String {
    let mut text =
        String::from("The following is a list of all available commands and their use case:\n");
    for kind in CommandKind::ALL {
        text.push_str(&format!("- '{}': {}\n", kind.usage(), kind.description()));
    }
    text
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    Register { username: String, hash: String },
    Login { username: String, hash: String },
    Logout,
    NewChat { recipient: String },
    Accept,
    Decline,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("'{0}' is not a valid command. Use '/help' to list the available commands.")]
    Unknown(String),
    #[error("'{kind}' takes exactly {expected} argument(s) but got {got}. Usage: '{usage}'.", usage = .kind.usage())]
    WrongArgCount {
        kind: CommandKind,
        expected: usize,
        got: usize,
    },
}

impl Command {
    /// Parses a command payload. The token count is validated before any
    /// argument is read.
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let mut tokens = payload.split_whitespace();
        let name = tokens.next().unwrap_or_default();
        let kind = CommandKind::from_name(name).ok_or_else(|| CommandError::Unknown(name.to_string()))?;

        let args: Vec<&str> = tokens.collect();
        if args.len() != kind.arity() {
            return Err(CommandError::WrongArgCount {
                kind,
                expected: kind.arity(),
                got: args.len(),
            });
        }

        let command = match kind {
            CommandKind::Help => Command::Help,
            CommandKind::Quit => Command::Quit,
            CommandKind::Register => Command::Register {
                username: args[0].to_string(),
                hash: args[1].to_string(),
            },
            CommandKind::Login => Command::Login {
                username: args[0].to_string(),
                hash: args[1].to_string(),
            },
            CommandKind::Logout => Command::Logout,
            CommandKind::NewChat => Command::NewChat {
                recipient: args[0].to_string(),
            },
            CommandKind::Accept => Command::Accept,
            CommandKind::Decline => Command::Decline,
        };
        Ok(command)
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Help => CommandKind::Help,
            Command::Quit => CommandKind::Quit,
            Command::Register { .. } => CommandKind::Register,
            Command::Login { .. } => CommandKind::Login,
            Command::Logout => CommandKind::Logout,
            Command::NewChat { .. } => CommandKind::NewChat,
            Command::Accept => CommandKind::Accept,
            Command::Decline => CommandKind::Decline,
        }
    }
}

/// Canonical wire form: the name followed by single-space separated arguments.
impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = self.kind().name();
        match self {
            Command::Register { username, hash } | Command::Login { username, hash } => {
                write!(f, "{name} {username} {hash}")
            }
            Command::NewChat { recipient } => write!(f, "{name} {recipient}"),
            _ => f.write_str(name),
        }
    }
}
