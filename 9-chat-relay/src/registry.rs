//! Bookkeeping for the sessions currently admitted to the relay.
//!
//! Capacity is tracked twice on purpose: the semaphore lets the acceptor
//! wait for a free slot before it accepts, and the member list enforces
//! `len <= max_clients` under the lock no matter how admissions race.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::{message::SessionId, session::Session};

#[derive(Debug, Error)]
#[error("registry is closed")]
pub struct RegistryClosed;

/// Why [`Registry::try_add`] turned a session away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("relay is shutting down")]
    ShuttingDown,
    #[error("relay is full")]
    Full,
    #[error("session is already closed")]
    SessionClosed,
}

/// A reserved unit of capacity. Dropping it frees the slot.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

struct Member {
    session: Arc<Session>,
    _slot: Slot,
}

#[derive(Default)]
struct Members {
    sessions: Vec<Member>,
    closed: bool,
}

pub struct Registry {
    members: Mutex<Members>,
    slots: Arc<Semaphore>,
    max_clients: usize,
}

impl Registry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            members: Mutex::new(Members::default()),
            slots: Arc::new(Semaphore::new(max_clients)),
            max_clients,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Slots neither held by a member nor reserved by a pending handshake.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Waits until a slot is free and reserves it.
    pub async fn reserve(&self) -> Result<Slot, RegistryClosed> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map(|permit| Slot { _permit: permit })
            .map_err(|_| RegistryClosed)
    }

    /// Admits `session` if the registry is open and below capacity, marking
    /// it active. The slot stays taken until the session is removed.
    pub async fn try_add(&self, session: Arc<Session>, slot: Slot) -> Result<(), AdmitError> {
        let mut members = self.members.lock().await;
        if members.closed {
            return Err(AdmitError::ShuttingDown);
        }
        if members.sessions.len() >= self.max_clients {
            return Err(AdmitError::Full);
        }
        if !session.activate() {
            return Err(AdmitError::SessionClosed);
        }
        members.sessions.push(Member {
            session,
            _slot: slot,
        });
        Ok(())
    }

    pub async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut members = self.members.lock().await;
        let index = members
            .sessions
            .iter()
            .position(|member| member.session.id() == id)?;
        Some(members.sessions.remove(index).session)
    }

    /// Point-in-time copy of the members, in admission order.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let members = self.members.lock().await;
        members
            .sessions
            .iter()
            .map(|member| Arc::clone(&member.session))
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.members.lock().await.sessions.len()
    }

    /// Refuses all further admissions and hands back every member.
    pub async fn close(&self) -> Vec<Arc<Session>> {
        let mut members = self.members.lock().await;
        members.closed = true;
        self.slots.close();
        members
            .sessions
            .drain(..)
            .map(|member| member.session)
            .collect()
    }
}
