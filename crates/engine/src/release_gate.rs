// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! One-bit gate marking a stream incarnation as fully released.
//!
//! Set means "no resources held"; admission claims the gate (set -> clear)
//! atomically before building anything, and the drain path sets it again
//! once every element is gone and the slot is back in the pool.

use std::time::Duration;
use tokio::sync::watch;

pub struct ReleaseGate {
    tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ReleaseGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseGate").field("set", &self.is_set()).finish()
    }
}

impl Default for ReleaseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseGate {
    /// Creates a gate in the set state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx }
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    /// Clears the gate if it is set. Returns whether this call cleared it.
    pub fn try_claim(&self) -> bool {
        self.tx.send_if_modified(|set| {
            if *set {
                *set = false;
                true
            } else {
                false
            }
        })
    }

    /// Waits up to `timeout` for the gate to become set.
    pub async fn wait_set(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        // The `watch::Ref` temporary must drop before `rx`.
        #[allow(clippy::let_and_return)]
        let woke = matches!(tokio::time::timeout(timeout, rx.wait_for(|set| *set)).await, Ok(Ok(_)));
        woke
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_claim_is_exclusive() {
        let gate = ReleaseGate::new();
        assert!(gate.is_set());
        assert!(gate.try_claim());
        assert!(!gate.try_claim());
        gate.set();
        assert!(gate.try_claim());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_set_times_out_while_claimed() {
        let gate = ReleaseGate::new();
        assert!(gate.try_claim());
        assert!(!gate.wait_set(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_wait_set_wakes_on_set() {
        let gate = Arc::new(ReleaseGate::new());
        assert!(gate.try_claim());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_set(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        gate.set();
        assert!(waiter.await.unwrap());
    }
}
