// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Process-lifetime registry of resources already fetched by sub-requests.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Thread-safe set of claimed resource keys (fully resolved sub-request URLs).
///
/// Keys are never removed: a resource claimed once is never fetched again for
/// the lifetime of the registry. Construct one per proxy instance and share it
/// behind an `Arc`.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    claimed: Mutex<HashSet<String>>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `key`. Returns true only for the first caller.
    pub fn try_claim(&self, key: &str) -> bool {
        let mut claimed = self.lock();
        if claimed.contains(key) {
            return false;
        }
        claimed.insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave the set half-updated, so a
    // poisoned guard is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.claimed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("DedupRegistry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
