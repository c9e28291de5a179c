//! Turns a line typed by the user into the packet sent to the server.
//!
//! Commands are checked here so a malformed one is never sent, and
//! passwords are replaced by their digest before they leave the machine.

use messenger_server::{Command, CommandError, Packet};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("nothing to send")]
    Empty,
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// SHA-256 of the password, hex encoded so it is a single safe token.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

pub fn prepare_input(line: &str) -> Result<Packet, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(InputError::Empty);
    }
    if !line.starts_with('/') {
        return Ok(Packet::message(line));
    }

    let command = match Command::parse(line)? {
        Command::Register { username, hash } => Command::Register {
            username,
            hash: hash_password(&hash),
        },
        Command::Login { username, hash } => Command::Login {
            username,
            hash: hash_password(&hash),
        },
        other => other,
    };
    Ok(Packet::command(command.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use messenger_server::{CommandKind, MessageType};

    #[test]
    fn test_hash_password_is_sha256_hex() {
        assert_eq!(
            hash_password("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_plain_message() {
        let packet = prepare_input("  hello there ").unwrap();
        assert_eq!(packet.message_type, MessageType::Message);
        assert_eq!(packet.payload, "hello there");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(prepare_input("   "), Err(InputError::Empty));
    }

    #[test]
    fn test_password_never_sent_in_clear() {
        let packet = prepare_input("/register alice hunter2").unwrap();
        assert_eq!(packet.message_type, MessageType::Command);
        assert_eq!(packet.payload, format!("/register alice {}", hash_password("hunter2")));
        assert!(!packet.payload.contains("hunter2"));

        let packet = prepare_input("/login alice hunter2").unwrap();
        assert_eq!(packet.payload, format!("/login alice {}", hash_password("hunter2")));
    }

    #[test]
    fn test_wrong_arity_is_not_sent() {
        let err = prepare_input("/newChat").unwrap_err();
        assert_eq!(
            err,
            InputError::Command(CommandError::WrongArgCount {
                kind: CommandKind::NewChat,
                expected: 1,
                got: 0,
            })
        );
        assert!(prepare_input("/accept now").is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            prepare_input("/shout hi"),
            Err(InputError::Command(CommandError::Unknown(_)))
        ));
    }
}
