use std::sync::Arc;

use tokio::{
    select,
    sync::{mpsc, watch},
};
use tracing::{debug, info};

use crate::{
    controller::stop_requested,
    message::{OutboundMessage, SessionEvent, SessionId},
    registry::Registry,
};

/// Creates the event queue shared by every session and the dispatcher.
///
/// Unbounded so a session's read loop never blocks on the dispatcher; a peer
/// that stalls a broadcast lets the backlog grow until its write fails.
pub fn channel() -> (DispatchQueue, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DispatchQueue { tx }, rx)
}

/// Producer side of the dispatcher queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl DispatchQueue {
    pub fn enqueue(&self, message: OutboundMessage) {
        self.send(SessionEvent::Message(message));
    }

    pub fn session_closed(&self, id: SessionId) {
        self.send(SessionEvent::Disconnected(id));
    }

    fn send(&self, event: SessionEvent) {
        if let Err(err) = self.tx.send(event) {
            debug!(event = ?err.0, "dispatcher stopped; dropping event");
        }
    }
}

/// Single consumer of the session event queue.
///
/// Events are handled strictly in arrival order. A broadcast awaits each
/// recipient's write before moving to the next, so one slow peer delays the
/// rest of that broadcast.
pub struct Dispatcher {
    registry: Arc<Registry>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, events: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        Self { registry, events }
    }

    /// Runs until `stop` flips to `true`. Whatever is still queued at that
    /// point is dropped.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        loop {
            select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        let dropped = self.events.len();
        if dropped > 0 {
            info!(dropped, "dispatcher stopped with undelivered events");
        } else {
            debug!("dispatcher stopped");
        }
    }

    async fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::Message(message) => {
                self.broadcast(&message).await;
            }
            SessionEvent::Disconnected(id) => {
                if let Some(session) = self.registry.remove(id).await {
                    info!(session = id, name = %session.name(), "session left");
                    self.broadcast(&OutboundMessage::disconnected(session.name()))
                        .await;
                }
            }
        }
    }

    /// Writes `message` to every registered session not named like its
    /// author. Returns how many sessions accepted the write.
    pub async fn broadcast(&self, message: &OutboundMessage) -> usize {
        info!(author = %message.author(), text = %message.text(), "broadcasting");

        let line = message.to_string();
        let mut delivered = 0;
        for session in self.registry.snapshot().await {
            if session.name() == message.author() {
                continue;
            }
            match session.write(&line).await {
                Ok(()) => delivered += 1,
                Err(err) => debug!(session = session.id(), error = ?err, "dropping delivery"),
            }
        }
        delivered
    }
}
