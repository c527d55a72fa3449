use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    dispatcher::DispatchQueue,
    frame::{read_frame, write_frame},
    message::{OutboundMessage, SessionId},
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Active,
    Closed,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed before a display name was sent")]
    Closed,
    #[error("no display name received within {0:?}")]
    TimedOut(Duration),
    #[error("display name cannot be empty")]
    EmptyName,
    #[error("failed to read display name: {0}")]
    Io(#[from] io::Error),
}

/// Reads the peer's display name: the first frame it sends, trimmed.
pub async fn handshake<R>(
    reader: &mut R,
    limit: Duration,
    max_frame_bytes: usize,
) -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let frame = timeout(limit, read_frame(reader, max_frame_bytes))
        .await
        .map_err(|_| HandshakeError::TimedOut(limit))??;

    let name = frame.ok_or(HandshakeError::Closed)?.trim().to_string();
    if name.is_empty() {
        return Err(HandshakeError::EmptyName);
    }
    Ok(name)
}

/// One connected peer.
///
/// The write half sits behind its own lock so the dispatcher and the
/// session's own shutdown never interleave on the wire. The state lives in a
/// watch channel; whoever flips it to [`SessionState::Closed`] first decides
/// whether a disconnect is reported.
pub struct Session {
    id: SessionId,
    name: String,
    peer: SocketAddr,
    writer: Mutex<Option<BoxedWriter>>,
    state: watch::Sender<SessionState>,
    queue: DispatchQueue,
}

impl Session {
    pub fn new<W>(
        id: SessionId,
        name: String,
        peer: SocketAddr,
        writer: W,
        queue: DispatchQueue,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(SessionState::Handshaking);
        Self {
            id,
            name,
            peer,
            writer: Mutex::new(Some(Box::new(writer))),
            state,
            queue,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Moves a handshaken session to `Active`. Only the registry calls this,
    /// under its lock, so membership and state change together.
    pub(crate) fn activate(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Handshaking {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        })
    }

    fn mark_closed(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        })
    }

    /// Sends one frame to the peer.
    ///
    /// A failed write closes the session and reports the disconnect; the
    /// write is not retried.
    pub async fn write(&self, text: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let stream = match writer.as_mut() {
            Some(stream) if self.state() != SessionState::Closed => stream,
            _ => return Err(io::ErrorKind::NotConnected.into()),
        };

        if let Err(err) = write_frame(stream, text).await {
            drop(writer);
            self.fail(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Closes the session on behalf of the relay. No disconnect is reported.
    ///
    /// Returns `true` if this call released the connection.
    pub async fn close(&self) -> bool {
        self.mark_closed();
        self.release().await
    }

    /// Relays every frame the peer sends until the connection ends or the
    /// session is closed, then releases the connection.
    pub async fn run<R>(self: Arc<Self>, mut reader: R, max_frame_bytes: usize)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut state = self.state.subscribe();

        loop {
            select! {
                _ = closed(&mut state) => break,
                frame = read_frame(&mut reader, max_frame_bytes) => match frame {
                    Ok(Some(text)) if text.trim().is_empty() => {}
                    Ok(Some(text)) => {
                        self.queue.enqueue(OutboundMessage::new(self.name.clone(), text));
                    }
                    Ok(None) => {
                        self.fail(&"peer closed the connection");
                        break;
                    }
                    Err(err) => {
                        self.fail(&err);
                        break;
                    }
                },
            }
        }

        self.release().await;
    }

    fn fail(&self, reason: &dyn std::fmt::Display) {
        if self.mark_closed() {
            info!(session = self.id, peer = %self.peer, name = %self.name, %reason, "session closed");
            self.queue.session_closed(self.id);
        }
    }

    async fn release(&self) -> bool {
        let taken = self.writer.lock().await.take();
        match taken {
            Some(mut writer) => {
                if let Err(err) = writer.shutdown().await {
                    debug!(session = self.id, error = ?err, "failed to shut down connection");
                }
                true
            }
            None => false,
        }
    }
}

async fn closed(state: &mut watch::Receiver<SessionState>) {
    let _ = state.wait_for(|state| *state == SessionState::Closed).await;
}
