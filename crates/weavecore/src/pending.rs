//! Pending-input registry.
//!
//! Lets a node suspend until an external event (end of a recording, a form
//! submission) delivers its value. At most one waiter exists per node id.

use crate::{NodeId, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PendingInputError {
    #[error("Node {0} is already waiting for input")]
    AlreadyWaiting(NodeId),
}

struct Waiter {
    ticket: u64,
    sender: oneshot::Sender<Option<Value>>,
}

#[derive(Clone, Default)]
pub struct PendingInputRegistry {
    waiters: Arc<Mutex<HashMap<NodeId, Waiter>>>,
    tickets: Arc<AtomicU64>,
}

impl PendingInputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `node_id`.
    ///
    /// Fails if another live waiter is outstanding for the same id. A waiter
    /// whose receiving side is already gone does not count.
    pub fn wait_for_input(&self, node_id: &str) -> Result<PendingInput, PendingInputError> {
        let mut waiters = self.waiters.lock();
        if let Some(existing) = waiters.get(node_id) {
            if !existing.sender.is_closed() {
                return Err(PendingInputError::AlreadyWaiting(node_id.to_string()));
            }
        }

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        waiters.insert(node_id.to_string(), Waiter { ticket, sender });
        tracing::debug!(node_id, "Registered pending input");

        Ok(PendingInput {
            node_id: node_id.to_string(),
            ticket,
            receiver,
            waiters: self.waiters.clone(),
        })
    }

    /// Deliver `data` to the waiter for `node_id`. Returns false if none.
    pub fn resolve_input(&self, node_id: &str, data: Value) -> bool {
        let waiter = self.waiters.lock().remove(node_id);
        match waiter {
            Some(waiter) => {
                tracing::debug!(node_id, "Resolved pending input");
                waiter.sender.send(Some(data)).is_ok()
            }
            None => {
                tracing::debug!(node_id, "No pending input to resolve");
                false
            }
        }
    }

    /// Release every waiter with `None` and empty the registry.
    pub fn clear(&self) -> usize {
        let drained: Vec<Waiter> = self.waiters.lock().drain().map(|(_, w)| w).collect();
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.sender.send(None);
        }
        if count > 0 {
            tracing::debug!(count, "Cleared pending inputs");
        }
        count
    }

    pub fn is_waiting(&self, node_id: &str) -> bool {
        self.waiters
            .lock()
            .get(node_id)
            .is_some_and(|w| !w.sender.is_closed())
    }

    pub fn waiting_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .waiters
            .lock()
            .iter()
            .filter(|(_, w)| !w.sender.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Outstanding wait; resolves to the delivered value, or `None` when cleared.
pub struct PendingInput {
    node_id: NodeId,
    ticket: u64,
    receiver: oneshot::Receiver<Option<Value>>,
    waiters: Arc<Mutex<HashMap<NodeId, Waiter>>>,
}

impl PendingInput {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl Future for PendingInput {
    type Output = Option<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.ok().flatten())
    }
}

impl Drop for PendingInput {
    fn drop(&mut self) {
        let mut waiters = self.waiters.lock();
        if waiters
            .get(&self.node_id)
            .is_some_and(|w| w.ticket == self.ticket)
        {
            waiters.remove(&self.node_id);
        }
    }
}
