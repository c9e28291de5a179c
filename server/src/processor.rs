use std::net::SocketAddr;

use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::messages::Packet;
use crate::session::ConnectionId;

/// What connection handlers hand to the processor.
#[derive(Debug)]
pub enum Inbound {
    /// A packet read from the connection.
    Packet {
        conn: ConnectionId,
        addr: SocketAddr,
        packet: Packet,
    },
    /// The connection's reader stopped. Always the last event a handler sends.
    Departed { conn: ConnectionId, addr: SocketAddr },
}

/// Sole consumer of the inbound channel. Running every command and every
/// departure on this one task keeps per-connection order and serializes all
/// state changes.
pub struct MessageProcessor {
    dispatcher: Dispatcher,
    inbound: Receiver<Inbound>,
    cancel: CancellationToken,
}

impl MessageProcessor {
    pub fn new(dispatcher: Dispatcher, inbound: Receiver<Inbound>, cancel: CancellationToken) -> Self {
        Self {
            dispatcher,
            inbound,
            cancel,
        }
    }

    pub async fn run(mut self) {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.process(message).await;
        }

        // Handlers whose departure can no longer be queued clean up after
        // themselves. Departures already queued are still honoured; packets
        // are not.
        self.inbound.close();
        let mut dropped = 0usize;
        while let Some(message) = self.inbound.recv().await {
            match message {
                Inbound::Departed { conn, addr } => self.depart(conn, addr).await,
                Inbound::Packet { .. } => dropped += 1,
            }
        }
        info!(dropped, "message processor stopped");
    }

    async fn process(&self, message: Inbound) {
        match message {
            Inbound::Packet { conn, addr, packet } if packet.is_command() => {
                // Payloads may carry password hashes, so they are not logged.
                debug!(%conn, %addr, "command received");
                self.dispatcher.dispatch(conn, &packet.payload).await;
            }
            Inbound::Packet { conn, addr, packet } => {
                // There is no message relay; plain text is only logged.
                info!(%conn, %addr, %packet, "message received");
            }
            Inbound::Departed { conn, addr } => self.depart(conn, addr).await,
        }
    }

    async fn depart(&self, conn: ConnectionId, addr: SocketAddr) {
        debug!(%conn, %addr, "connection departed");
        self.dispatcher.depart(conn).await;
    }
}
