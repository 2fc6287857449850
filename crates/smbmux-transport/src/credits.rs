//! Credit-based flow control.
//!
//! The server grants credits; every request consumes `credit_charge` of them
//! until its response arrives. [`CreditTracker`] keeps `granted` and `in_flight`
//! packed in a single atomic word so that reservations, releases and server
//! updates are linearizable without a lock on the hot path.
//!
//! # Invariant
//!
//! `in_flight <= granted` holds after every operation.
//!
//! # Example
//!
//! ```
//! use smbmux_transport::credits::CreditTracker;
//!
//! let credits = CreditTracker::new(5);
//! assert!(credits.try_reserve(5));
//! // Response for the charge-5 request grants 3 new credits.
//! credits.settle(5, 3);
//! assert_eq!(credits.granted(), 3);
//! assert_eq!(credits.in_flight(), 0);
//! assert!(!credits.try_reserve(4));
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Point-in-time view of the credit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditSnapshot {
    /// Credits granted by the server.
    pub granted: u32,
    /// Credits consumed by outstanding requests.
    pub in_flight: u32,
}

impl CreditSnapshot {
    /// Credits available for new requests.
    pub fn available(&self) -> u32 {
        self.granted - self.in_flight
    }
}

fn pack(granted: u32, in_flight: u32) -> u64 {
    ((granted as u64) << 32) | in_flight as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Bookkeeping of flow-control credits for one connection.
///
/// Never blocks: callers that fail [`try_reserve`](Self::try_reserve) decide
/// whether to queue (see [`notified`](Self::notified)) or give up.
pub struct CreditTracker {
    state: AtomicU64,
    released: Notify,
}

impl CreditTracker {
    /// Creates a tracker seeded with the credits granted at negotiation.
    pub fn new(initial_granted: u32) -> Self {
        Self {
            state: AtomicU64::new(pack(initial_granted, 0)),
            released: Notify::new(),
        }
    }

    fn modify<F>(&self, mut f: F) -> CreditSnapshot
    where
        F: FnMut(u32, u32) -> (u32, u32),
    {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (granted, in_flight) = unpack(current);
            let (new_granted, new_in_flight) = f(granted, in_flight);
            debug_assert!(new_in_flight <= new_granted);
            match self.state.compare_exchange_weak(
                current,
                pack(new_granted, new_in_flight),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return CreditSnapshot { granted: new_granted, in_flight: new_in_flight };
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomically reserves `n` credits if at least `n` are unused.
    ///
    /// Fails without side effects otherwise.
    pub fn try_reserve(&self, n: u32) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (granted, in_flight) = unpack(current);
            if granted - in_flight < n {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                pack(granted, in_flight + n),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns `n` reserved credits without changing the grant.
    ///
    /// Used when a reservation is abandoned before the request hits the wire.
    pub fn release(&self, n: u32) {
        self.modify(|granted, in_flight| (granted, in_flight.saturating_sub(n)));
        self.released.notify_waiters();
    }

    /// Sets `granted` from a server-advertised absolute value.
    ///
    /// The grant never drops below what outstanding requests already consumed,
    /// and concurrent updates never overwrite one another.
    pub fn update(&self, new_granted: u32) {
        let snap = self.modify(|_, in_flight| (new_granted.max(in_flight), in_flight));
        debug!(granted = snap.granted, in_flight = snap.in_flight, "credit grant updated");
        self.released.notify_waiters();
    }

    /// Settles a completed request: consumes its `charge` and adds the `grant`
    /// carried on the response (SMB2 additive credit semantics).
    pub fn settle(&self, charge: u32, grant: u32) -> CreditSnapshot {
        let snap = self.modify(|granted, in_flight| {
            let charge = charge.min(in_flight);
            (
                (granted - charge).saturating_add(grant),
                in_flight - charge,
            )
        });
        if grant == 0 {
            if snap.available() == 0 && snap.in_flight == 0 {
                warn!("server took away all our credits");
            } else {
                debug!(charge, "server returned zero credits");
            }
        }
        self.released.notify_waiters();
        snap
    }

    /// Adds credits without settling a request (interim responses).
    pub fn grant(&self, n: u32) {
        if n == 0 {
            return;
        }
        self.modify(|granted, in_flight| (granted.saturating_add(n), in_flight));
        self.released.notify_waiters();
    }

    /// Wakes every task waiting in [`notified`](Self::notified) without
    /// changing the counters, e.g. when the connection fails.
    pub fn wake_all(&self) {
        self.released.notify_waiters();
    }

    /// Credits currently granted.
    pub fn granted(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// Credits consumed by outstanding requests.
    pub fn in_flight(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    /// Credits available for new requests.
    pub fn available(&self) -> u32 {
        self.snapshot().available()
    }

    /// Consistent snapshot of both counters.
    pub fn snapshot(&self) -> CreditSnapshot {
        let (granted, in_flight) = unpack(self.state.load(Ordering::Acquire));
        CreditSnapshot { granted, in_flight }
    }

    /// Future that completes the next time credits are released or granted.
    ///
    /// Create it before re-checking [`try_reserve`](Self::try_reserve) so a
    /// release in between is not missed.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.released.notified()
    }
}

impl std::fmt::Debug for CreditTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditTracker").field("state", &self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_until_exhausted() {
        let credits = CreditTracker::new(3);
        assert!(credits.try_reserve(2));
        assert!(credits.try_reserve(1));
        assert!(!credits.try_reserve(1));
        assert_eq!(credits.snapshot(), CreditSnapshot { granted: 3, in_flight: 3 });
    }

    #[test]
    fn test_failed_reserve_has_no_side_effects() {
        let credits = CreditTracker::new(2);
        assert!(!credits.try_reserve(3));
        assert_eq!(credits.in_flight(), 0);
    }

    #[test]
    fn test_settle_scenario() {
        let credits = CreditTracker::new(5);
        assert!(credits.try_reserve(5));
        let snap = credits.settle(5, 3);
        assert_eq!(snap.granted, 3);
        assert_eq!(snap.in_flight, 0);
        assert!(!credits.try_reserve(4));
        assert!(credits.try_reserve(3));
    }

    #[test]
    fn test_update_never_below_in_flight() {
        let credits = CreditTracker::new(10);
        assert!(credits.try_reserve(6));
        credits.update(2);
        assert_eq!(credits.granted(), 6);
        assert_eq!(credits.available(), 0);
        credits.release(6);
        credits.update(2);
        assert_eq!(credits.granted(), 2);
    }

    #[test]
    fn test_release_then_update() {
        let credits = CreditTracker::new(5);
        assert!(credits.try_reserve(5));
        credits.release(5);
        credits.update(3);
        assert_eq!(credits.snapshot(), CreditSnapshot { granted: 3, in_flight: 0 });
    }

    #[test]
    fn test_grant_adds_credits() {
        let credits = CreditTracker::new(1);
        credits.grant(4);
        credits.grant(0);
        assert_eq!(credits.granted(), 5);
    }

    #[test]
    fn test_settle_clamps_overlong_charge() {
        let credits = CreditTracker::new(4);
        assert!(credits.try_reserve(1));
        let snap = credits.settle(3, 1);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.granted, 4);
    }

    #[test]
    fn test_concurrent_reservations_respect_grant() {
        let credits = Arc::new(CreditTracker::new(100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let credits = credits.clone();
                std::thread::spawn(move || (0..50).filter(|_| credits.try_reserve(1)).count())
            })
            .collect();
        let reserved: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(reserved, 100);
        assert_eq!(credits.in_flight(), 100);
    }

    #[tokio::test]
    async fn test_notified_wakes_on_settle() {
        let credits = Arc::new(CreditTracker::new(1));
        assert!(credits.try_reserve(1));
        let waiter = {
            let credits = credits.clone();
            tokio::spawn(async move {
                loop {
                    let notified = credits.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if credits.try_reserve(1) {
                        return;
                    }
                    notified.await;
                }
            })
        };
        tokio::task::yield_now().await;
        credits.settle(1, 1);
        waiter.await.unwrap();
        assert_eq!(credits.in_flight(), 1);
    }
}

#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(u32),
        Release(u32),
        Settle(u32, u32),
        Update(u32),
        Grant(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..8).prop_map(Op::Reserve),
            (1u32..8).prop_map(Op::Release),
            (1u32..8, 0u32..8).prop_map(|(c, g)| Op::Settle(c, g)),
            (0u32..64).prop_map(Op::Update),
            (0u32..8).prop_map(Op::Grant),
        ]
    }

    proptest! {
        #[test]
        fn test_in_flight_never_exceeds_granted(
            initial in 0u32..32,
            ops in proptest::collection::vec(op(), 1..200),
        ) {
            let credits = CreditTracker::new(initial);
            for op in ops {
                let before = credits.snapshot();
                match op {
                    Op::Reserve(n) => {
                        let ok = credits.try_reserve(n);
                        prop_assert_eq!(ok, before.available() >= n);
                        if !ok {
                            prop_assert_eq!(credits.snapshot(), before);
                        }
                    }
                    Op::Release(n) => credits.release(n),
                    Op::Settle(c, g) => {
                        credits.settle(c, g);
                    }
                    Op::Update(n) => credits.update(n),
                    Op::Grant(n) => credits.grant(n),
                }
                let snap = credits.snapshot();
                prop_assert!(snap.in_flight <= snap.granted);
            }
        }

        #[test]
        fn test_settle_is_additive(granted in 1u32..64, grant in 0u32..64) {
            let credits = CreditTracker::new(granted);
            prop_assert!(credits.try_reserve(granted));
            let snap = credits.settle(granted, grant);
            prop_assert_eq!(snap, CreditSnapshot { granted: grant, in_flight: 0 });
        }
    }
}
