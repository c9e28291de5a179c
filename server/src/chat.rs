use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::credentials::StoreError;
use crate::dispatcher::Dispatcher;
use crate::messages::{FrameError, Packet, read_packet, write_packet};
use crate::processor::{Inbound, MessageProcessor};
use crate::session::ConnectionId;
use crate::state::ServerState;

/// Back-off after a failed `accept`, so errors like EMFILE don't spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to load credentials: {0}")]
    Load(#[source] StoreError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("failed to save credentials: {0}")]
    Save(#[source] StoreError),
}

/// A bound, not yet running server.
pub struct ChatServer {
    state: Arc<ServerState>,
    listener: TcpListener,
}

impl ChatServer {
    /// Loads the credential store and binds the listener. Either failure is
    /// fatal.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = config.listen_addr;
        let state = ServerState::load(config).await.map_err(ServerError::Load)?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            state: Arc::new(state),
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Serves clients until `shutdown` resolves, then cancels every task,
    /// waits for all connections to close and saves the credentials.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self { state, listener } = self;
        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(state.config.inbound_capacity());

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "chat server listening");
        }

        let processor = MessageProcessor::new(
            Dispatcher::new(Arc::clone(&state)),
            inbound_rx,
            cancel.clone(),
        );
        let processor_task = tokio::spawn(processor.run());
        let acceptor_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            inbound_tx,
            cancel.clone(),
        ));

        shutdown.await;
        info!("shutdown requested, closing connections");
        cancel.cancel();

        if let Err(e) = acceptor_task.await {
            error!(error = %e, "acceptor task failed");
        }
        if let Err(e) = processor_task.await {
            error!(error = %e, "message processor task failed");
        }

        // Every handler has exited by now, so nothing can race the save.
        let users = state.credentials.len().await;
        info!(users, "saving credentials");
        state.credentials.save().await.map_err(ServerError::Save)?;
        info!("shutdown complete");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    inbound: Sender<Inbound>,
    cancel: CancellationToken,
) {
    let tracker = TaskTracker::new();

    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let conn = Uuid::new_v4();
        let conn_cancel = cancel.child_token();
        let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_capacity());
        state
            .sessions
            .attach(conn, addr, outbound_tx, conn_cancel.clone())
            .await;
        let connections = state.sessions.len().await;
        info!(%conn, %addr, connections, "client connected");

        tracker.spawn(handle_connection(
            Arc::clone(&state),
            conn,
            addr,
            stream,
            inbound.clone(),
            outbound_rx,
            conn_cancel,
        ));
    }

    drop(listener);
    tracker.close();
    info!(handlers = tracker.len(), "stopped accepting, waiting for client handlers");
    tracker.wait().await;
    info!("all client handlers terminated");
}

async fn handle_connection(
    state: Arc<ServerState>,
    conn: ConnectionId,
    addr: SocketAddr,
    stream: TcpStream,
    inbound: Sender<Inbound>,
    outbound: Receiver<Packet>,
    cancel: CancellationToken,
) {
    let (mut reader, writer) = tokio::io::split(stream);
    let writer_task = spawn_writer(conn, writer, outbound, cancel.clone(), state.config.write_timeout);

    read_loop(&state, conn, addr, &mut reader, &inbound, &cancel).await;

    // Departures queue behind this connection's packets so the processor
    // handles them in order with every other command. Once it has stopped
    // there is nothing left to race, so clean up here.
    if inbound.send(Inbound::Departed { conn, addr }).await.is_err() {
        state.depart(&conn).await;
    }
    // Detaching drops the last outbound sender; the writer flushes what is
    // queued and exits.
    if let Err(e) = writer_task.await {
        error!(%conn, error = %e, "writer task failed");
    }
    info!(%conn, %addr, "connection closed");
}

async fn read_loop(
    state: &ServerState,
    conn: ConnectionId,
    addr: SocketAddr,
    reader: &mut ReadHalf<TcpStream>,
    inbound: &Sender<Inbound>,
    cancel: &CancellationToken,
) {
    let max_len = state.config.max_frame_len;
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%conn, "connection cancelled");
                return;
            }
            frame = read_packet(reader, max_len) => frame,
        };

        let packet = match frame {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                info!(%conn, %addr, "client closed connection");
                return;
            }
            Err(FrameError::Io(e)) => {
                warn!(%conn, %addr, error = %e, "error reading from client");
                return;
            }
            Err(e) => {
                warn!(%conn, %addr, error = %e, "protocol error, dropping client");
                return;
            }
        };

        // A full channel blocks here, which is the backpressure on readers.
        let message = Inbound::Packet { conn, addr, packet };
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = inbound.send(message) => {
                if sent.is_err() {
                    debug!(%conn, "message processor gone");
                    return;
                }
            }
        }
    }
}

fn spawn_writer(
    conn: ConnectionId,
    mut writer: WriteHalf<TcpStream>,
    mut outbound: Receiver<Packet>,
    cancel: CancellationToken,
    write_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Queued replies win over cancellation so a final error message
            // still reaches the client.
            let packet = tokio::select! {
                biased;
                packet = outbound.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            match tokio::time::timeout(write_timeout, write_packet(&mut writer, &packet)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(%conn, error = %e, "error writing to client");
                    cancel.cancel();
                    break;
                }
                Err(_) => {
                    warn!(%conn, "write to client timed out");
                    cancel.cancel();
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    })
}
