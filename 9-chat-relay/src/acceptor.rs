use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    controller::stop_requested,
    dispatcher::DispatchQueue,
    frame::write_frame,
    message::{OutboundMessage, SessionId},
    registry::{AdmitError, Registry, Slot},
    session::{self, HandshakeError, Session},
};

/// Turns inbound connections into registered sessions.
///
/// A slot is reserved before every accept, so a full relay simply stops
/// accepting and new attempts wait in the listen backlog until a session
/// leaves.
pub struct Acceptor {
    listener: TcpListener,
    registry: Arc<Registry>,
    queue: DispatchQueue,
    handshake_timeout: Duration,
    max_frame_bytes: usize,
    next_id: SessionId,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        registry: Arc<Registry>,
        queue: DispatchQueue,
        config: &RelayConfig,
    ) -> Self {
        Self {
            listener,
            registry,
            queue,
            handshake_timeout: config.handshake_timeout,
            max_frame_bytes: config.max_frame_bytes,
            next_id: 1,
        }
    }

    /// Accepts until `stop` flips. An accept error ends the loop and is
    /// returned to the caller.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        loop {
            if self.registry.available_slots() == 0 {
                info!(
                    max_clients = self.registry.max_clients(),
                    "relay is full; pausing accept"
                );
            }

            let slot = select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                slot = self.registry.reserve() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let (stream, peer) = select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                accepted = self.listener.accept() => {
                    accepted.context("failed to accept connection")?
                }
            };

            self.spawn_admission(stream, peer, slot, stop.clone());
        }

        debug!("acceptor stopped");
        Ok(())
    }

    fn spawn_admission(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        slot: Slot,
        stop: watch::Receiver<bool>,
    ) {
        let admission = Admission {
            id: self.next_id,
            stop,
            registry: Arc::clone(&self.registry),
            queue: self.queue.clone(),
            handshake_timeout: self.handshake_timeout,
            max_frame_bytes: self.max_frame_bytes,
        };
        self.next_id += 1;

        debug!(session = admission.id, %peer, "accepted connection");
        tokio::spawn(admission.run(stream, peer, slot));
    }
}

/// Everything one connection task needs: handshake, registration, then the
/// session's read loop.
struct Admission {
    id: SessionId,
    stop: watch::Receiver<bool>,
    registry: Arc<Registry>,
    queue: DispatchQueue,
    handshake_timeout: Duration,
    max_frame_bytes: usize,
}

impl Admission {
    async fn run(mut self, stream: TcpStream, peer: SocketAddr, slot: Slot) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = ?err, "failed to disable nagle");
        }

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let handshake =
            session::handshake(&mut reader, self.handshake_timeout, self.max_frame_bytes);
        let result = select! {
            biased;
            _ = stop_requested(&mut self.stop) => {
                debug!(%peer, "relay stopping; dropping unnamed connection");
                if let Err(err) = writer.shutdown().await {
                    debug!(%peer, error = ?err, "failed to shut down connection");
                }
                return;
            }
            result = handshake => result,
        };

        let name = match result {
            Ok(name) => name,
            Err(err @ HandshakeError::EmptyName) => {
                info!(%peer, error = %err, "rejecting connection");
                reject(&mut writer, &err.to_string()).await;
                return;
            }
            Err(err) => {
                info!(%peer, error = %err, "handshake failed");
                return;
            }
        };

        let session = Arc::new(Session::new(self.id, name, peer, writer, self.queue.clone()));

        if let Err(err) = self.registry.try_add(Arc::clone(&session), slot).await {
            warn!(session = self.id, peer = %session.peer(), error = %err, "closing connection");
            if err != AdmitError::SessionClosed {
                let notice = OutboundMessage::system(err.to_string()).to_string();
                if let Err(err) = session.write(&notice).await {
                    debug!(session = self.id, error = ?err, "failed to send rejection");
                }
            }
            session.close().await;
            return;
        }

        info!(session = self.id, peer = %session.peer(), name = %session.name(), "session joined");
        self.queue.enqueue(OutboundMessage::connected(session.name()));

        session.run(reader, self.max_frame_bytes).await;
    }
}

async fn reject(writer: &mut OwnedWriteHalf, reason: &str) {
    let notice = OutboundMessage::system(reason).to_string();
    if let Err(err) = write_frame(writer, &notice).await {
        debug!(error = ?err, "failed to send rejection");
    }
}
