// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! One-shot waits for the outcome of replayed sub-requests.
//!
//! A resolver registers a wait for a sub-request id before asking the host to
//! replay it. The response or error hook for that flow later fulfills the wait.
//! Each wait is fulfilled at most once; whichever of response, error or
//! cancellation comes first removes the entry.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::flow::ResponseInfo;

#[derive(Debug, Clone)]
pub enum SubRequestOutcome {
    Response(ResponseInfo),
    Failed(String),
}

#[derive(Debug)]
pub enum WaitResult {
    Delivered(SubRequestOutcome),
    TimedOut,
    /// The producer side was dropped without delivering.
    Abandoned,
}

#[derive(Debug, Default)]
pub struct PendingWaits {
    waits: Mutex<HashMap<Uuid, oneshot::Sender<SubRequestOutcome>>>,
}

impl PendingWaits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid) -> PendingSourceMapWait {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(id, tx).is_some() {
            tracing::warn!(flow = %id, "replacing an existing wait");
        }
        PendingSourceMapWait { id, rx }
    }

    /// Deliver `outcome` to the waiter for `id`. Returns false when nobody
    /// is waiting (never registered, already fulfilled, or timed out).
    pub fn fulfill(&self, id: Uuid, outcome: SubRequestOutcome) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            return false;
        };
        tx.send(outcome).is_ok()
    }

    /// Drop the wait for `id` without delivering anything.
    pub fn cancel(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn is_waiting(&self, id: Uuid) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<SubRequestOutcome>>> {
        match self.waits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("PendingWaits lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Consumer half of a registered wait.
#[derive(Debug)]
pub struct PendingSourceMapWait {
    id: Uuid,
    rx: oneshot::Receiver<SubRequestOutcome>,
}

impl PendingSourceMapWait {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait(self, timeout: Duration) -> WaitResult {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcome)) => WaitResult::Delivered(outcome),
            Ok(Err(_)) => WaitResult::Abandoned,
            Err(_) => WaitResult::TimedOut,
        }
    }
}
