use anyhow::{Context, Result};
use messenger_server::{Packet, read_packet, write_packet};
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

mod prepare;

pub use prepare::{InputError, hash_password, prepare_input};

/// Largest reply the client accepts; `/help` is the biggest one the server sends.
const MAX_REPLY_LEN: usize = 64 * 1024;

pub type PacketSender = mpsc::Sender<Packet>;
pub type ReplyReceiver = Arc<Mutex<mpsc::Receiver<Reply>>>;

/// A server reply, split into the identity the server addressed us as and
/// the text itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub identity: String,
    pub text: String,
}

impl Reply {
    pub fn is_error(&self) -> bool {
        self.text.starts_with("[Error]")
    }
}

#[derive(Clone)]
pub struct Client {
    packet_sender: PacketSender,
    reply_receiver: ReplyReceiver,
    _connection_handle: Arc<tokio::task::JoinHandle<()>>,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(address: A) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .context("Failed to connect to server")?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Packet>(100);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Reply>(100);

        let connection_handle = tokio::spawn(Self::run_connection(stream, outgoing_rx, incoming_tx));

        Ok(Client {
            packet_sender: outgoing_tx,
            reply_receiver: Arc::new(Mutex::new(incoming_rx)),
            _connection_handle: Arc::new(connection_handle),
        })
    }

    /// Validates and sends one line of user input. Malformed commands are
    /// rejected here and never reach the server.
    pub async fn send_input(&self, line: &str) -> Result<()> {
        let packet = prepare_input(line)?;
        self.send_packet(packet).await
    }

    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        self.packet_sender
            .send(packet)
            .await
            .with_context(|| "Failed to send message")
    }

    pub fn send_input_blocking(&self, line: &str) -> Result<()> {
        let packet = prepare_input(line)?;
        self.packet_sender
            .try_send(packet)
            .with_context(|| "Failed to send message")
    }

    /// Next reply from the server; `None` once the connection is gone.
    pub async fn receive_message(&self) -> Option<Reply> {
        self.reply_receiver.lock().await.recv().await
    }

    pub fn try_receive_message(&self) -> Option<Reply> {
        self.reply_receiver
            .try_lock()
            .ok()?
            .try_recv()
            .ok()
    }

    async fn run_connection(
        stream: TcpStream,
        outgoing_rx: mpsc::Receiver<Packet>,
        incoming_tx: mpsc::Sender<Reply>,
    ) {
        let (read_stream, write_stream) = tokio::io::split(stream);

        let outgoing_task = Self::spawn_outgoing_handler(write_stream, outgoing_rx);
        let incoming_task = Self::spawn_incoming_handler(read_stream, incoming_tx);

        // Wait for either task to complete
        tokio::select! {
            _ = incoming_task => {},
            _ = outgoing_task => {},
        }
    }

    fn spawn_outgoing_handler(
        mut write_stream: WriteHalf<TcpStream>,
        mut outgoing_rx: mpsc::Receiver<Packet>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(packet) = outgoing_rx.recv().await {
                if let Err(e) = write_packet(&mut write_stream, &packet).await {
                    warn!(error = %e, "failed to write to server");
                    break;
                }
            }
        })
    }

    fn spawn_incoming_handler(
        mut read_stream: ReadHalf<TcpStream>,
        incoming_tx: mpsc::Sender<Reply>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match read_packet(&mut read_stream, MAX_REPLY_LEN).await {
                    Ok(Some(packet)) => {
                        let Some(reply) = Self::parse_server_message(&packet.payload) else {
                            debug!(payload = %packet.payload, "unrecognised reply format");
                            continue;
                        };
                        if incoming_tx.send(reply).await.is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Ok(None) => {
                        debug!("server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read from server");
                        break;
                    }
                }
            }
        })
    }

    fn parse_server_message(message: &str) -> Option<Reply> {
        // Expected format: "(alice) Login successful."
        let rest = message.strip_prefix('(')?;
        let (identity, text) = rest.split_once(") ")?;
        if identity.is_empty() {
            return None;
        }

        Some(Reply {
            identity: identity.to_string(),
            text: text.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invalid_message() {
        assert!(Client::parse_server_message("Invalid format").is_none());
        assert!(Client::parse_server_message("() empty identity").is_none());
        assert!(Client::parse_server_message("(alice)no space").is_none());
    }

    #[test]
    fn test_parse_valid_message() {
        let parsed = Client::parse_server_message("(alice) bob accepted your request.").unwrap();

        assert_eq!(parsed.identity, "alice");
        assert_eq!(parsed.text, "bob accepted your request.");
        assert!(!parsed.is_error());
    }

    #[test]
    fn test_parse_multiline_message() {
        let parsed = Client::parse_server_message("(anonymous) line one\nline two (x) y").unwrap();

        assert_eq!(parsed.identity, "anonymous");
        assert_eq!(parsed.text, "line one\nline two (x) y");
    }

    #[test]
    fn test_error_reply() {
        let parsed = Client::parse_server_message("(anonymous) [Error] You are not logged in.").unwrap();
        assert!(parsed.is_error());
    }
}
