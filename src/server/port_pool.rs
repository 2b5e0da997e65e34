use anyhow::anyhow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::session::endpoint::SessionEndpoint;

/// Handle to one allocation of a port slot. A slot's lease number changes on every allocation and
///  every release, so a handle that outlived its allocation (e.g. held by the receive loop of a
///  session that was already torn down) can never affect the slot's next occupant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SlotLease {
    pub index: usize,
    pub port: u16,
    lease: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortSlotInfo {
    pub port: u16,
    pub in_use: bool,
}

pub enum ReleaseOutcome {
    /// the lease was current, the slot is free now; carries the session that was bound to it
    Released(Option<Arc<SessionEndpoint>>),
    AlreadyFree,
}

struct PortSlot {
    port: u16,
    /// even: free, odd: in use. Incremented on every allocation and release.
    state: AtomicU64,
    session: Mutex<Option<(u64, Arc<SessionEndpoint>)>>,
    released: Notify,
}

/// Fixed capacity arena of port slots for the contiguous range `[port_base, port_base+capacity)`.
///  Its size is the hard upper bound for the number of concurrent sessions.
///
/// Allocation and release are single atomic transitions per slot, so concurrent accept paths
///  never need a lock to agree on who owns a slot. The per-slot mutex only guards the bound
///  session and is never held across an await.
pub struct PortPool {
    slots: Vec<PortSlot>,
}

impl PortPool {
    /// Fails if the range does not fit below port 65536.
    pub fn new(port_base: u16, capacity: u16) -> anyhow::Result<PortPool> {
        let slots = (0..capacity)
            .map(|i| match port_base.checked_add(i) {
                Some(port) => Ok(PortSlot {
                    port,
                    state: AtomicU64::new(0),
                    session: Mutex::new(None),
                    released: Notify::new(),
                }),
                None => Err(anyhow!("port range {}+{} exceeds the port number space", port_base, capacity)),
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(PortPool { slots })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// First-fit: the free slot with the lowest port is marked as used and returned.
    pub fn allocate(&self) -> Option<SlotLease> {
        for (index, slot) in self.slots.iter().enumerate() {
            let current = slot.state.load(Ordering::Acquire);
            if current % 2 == 1 {
                continue;
            }
            if slot.state.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return Some(SlotLease {
                    index,
                    port: slot.port,
                    lease: current + 1,
                });
            }
        }
        None
    }

    /// Frees the slot if `lease` is its current allocation. Only the first release of a given
    ///  lease succeeds.
    pub fn release(&self, lease: SlotLease) -> ReleaseOutcome {
        let slot = &self.slots[lease.index];
        if slot.state.compare_exchange(lease.lease, lease.lease + 1, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return ReleaseOutcome::AlreadyFree;
        }
        slot.released.notify_waiters();

        let mut session = slot.session.lock().unwrap();
        match session.take() {
            Some((l, endpoint)) if l == lease.lease => ReleaseOutcome::Released(Some(endpoint)),
            other => {
                *session = other;
                ReleaseOutcome::Released(None)
            }
        }
    }

    /// Associates an established session with its slot. Fails if the lease is not current any
    ///  more, i.e. the slot was released while the client was still connecting.
    pub fn bind_session(&self, lease: SlotLease, endpoint: Arc<SessionEndpoint>) -> bool {
        let slot = &self.slots[lease.index];
        let mut session = slot.session.lock().unwrap();
        if slot.state.load(Ordering::Acquire) != lease.lease {
            return false;
        }
        *session = Some((lease.lease, endpoint));
        true
    }

    /// Resolves once `lease` is not the slot's current allocation any more
    pub async fn wait_released(&self, lease: SlotLease) {
        let slot = &self.slots[lease.index];
        loop {
            let notified = slot.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if slot.state.load(Ordering::Acquire) != lease.lease {
                return;
            }
            notified.await;
        }
    }

    pub fn lease_for_port(&self, port: u16) -> Option<SlotLease> {
        self.slots.iter()
            .enumerate()
            .find(|(_, slot)| slot.port == port)
            .and_then(|(index, slot)| Self::current_lease(index, slot))
    }

    pub fn session_for_port(&self, port: u16) -> Option<Arc<SessionEndpoint>> {
        let slot = self.slots.iter().find(|slot| slot.port == port)?;
        let lease = slot.state.load(Ordering::Acquire);
        let session = slot.session.lock().unwrap();
        session.as_ref()
            .filter(|(l, _)| *l == lease)
            .map(|(_, endpoint)| endpoint.clone())
    }

    /// all current allocations, whether or not their session is established yet
    pub fn occupied(&self) -> Vec<SlotLease> {
        self.slots.iter()
            .enumerate()
            .filter_map(|(index, slot)| Self::current_lease(index, slot))
            .collect()
    }

    pub fn sessions(&self) -> Vec<(u16, Arc<SessionEndpoint>)> {
        self.slots.iter()
            .filter_map(|slot| {
                let lease = slot.state.load(Ordering::Acquire);
                let session = slot.session.lock().unwrap();
                session.as_ref()
                    .filter(|(l, _)| *l == lease)
                    .map(|(_, endpoint)| (slot.port, endpoint.clone()))
            })
            .collect()
    }

    pub fn count_in_use(&self) -> usize {
        self.slots.iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) % 2 == 1)
            .count()
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.count_in_use()
    }

    pub fn snapshot(&self) -> Vec<PortSlotInfo> {
        self.slots.iter()
            .map(|slot| PortSlotInfo {
                port: slot.port,
                in_use: slot.state.load(Ordering::Acquire) % 2 == 1,
            })
            .collect()
    }

    fn current_lease(index: usize, slot: &PortSlot) -> Option<SlotLease> {
        let lease = slot.state.load(Ordering::Acquire);
        (lease % 2 == 1).then_some(SlotLease {
            index,
            port: slot.port,
            lease,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use tokio::io::duplex;
    use super::*;

    fn endpoint() -> Arc<SessionEndpoint> {
        let (near, _) = duplex(16);
        Arc::new(SessionEndpoint::new("127.0.0.1:9".parse().unwrap(), near))
    }

    #[test]
    fn test_first_fit_allocation() {
        let pool = PortPool::new(30000, 3).unwrap();

        assert_eq!(pool.allocate().unwrap().port, 30000);
        let second = pool.allocate().unwrap();
        assert_eq!(second.port, 30001);
        assert_eq!(pool.allocate().unwrap().port, 30002);
        assert!(pool.allocate().is_none());
        assert_eq!(pool.free_count(), 0);

        assert!(matches!(pool.release(second), ReleaseOutcome::Released(None)));
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.allocate().unwrap().port, 30001);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = PortPool::new(30000, 2).unwrap();
        let lease = pool.allocate().unwrap();

        assert!(matches!(pool.release(lease), ReleaseOutcome::Released(_)));
        assert!(matches!(pool.release(lease), ReleaseOutcome::AlreadyFree));
        assert_eq!(pool.count_in_use(), 0);
    }

    #[test]
    fn test_stale_lease_does_not_touch_next_occupant() {
        let pool = PortPool::new(30000, 1).unwrap();
        let old = pool.allocate().unwrap();
        let _ = pool.release(old);
        let new = pool.allocate().unwrap();
        assert_eq!(old.port, new.port);
        assert_ne!(old, new);

        assert!(matches!(pool.release(old), ReleaseOutcome::AlreadyFree));
        assert!(!pool.bind_session(old, endpoint()));
        assert_eq!(pool.lease_for_port(30000), Some(new));
    }

    #[test]
    fn test_bound_session_is_returned_on_release() {
        let pool = PortPool::new(30000, 2).unwrap();
        let lease = pool.allocate().unwrap();
        let ep = endpoint();

        assert!(pool.session_for_port(30000).is_none());
        assert!(pool.bind_session(lease, ep.clone()));
        assert!(Arc::ptr_eq(&pool.session_for_port(30000).unwrap(), &ep));
        assert_eq!(pool.sessions().len(), 1);

        match pool.release(lease) {
            ReleaseOutcome::Released(Some(released)) => assert!(Arc::ptr_eq(&released, &ep)),
            _ => panic!("expected the bound session"),
        }
        assert!(pool.session_for_port(30000).is_none());
        assert!(pool.sessions().is_empty());
    }

    #[test]
    fn test_snapshot_and_lookup() {
        let pool = PortPool::new(30000, 3).unwrap();
        let _ = pool.allocate();
        let second = pool.allocate().unwrap();
        let _ = pool.release(pool.lease_for_port(30000).unwrap());

        assert_eq!(pool.snapshot(), vec![
            PortSlotInfo { port: 30000, in_use: false },
            PortSlotInfo { port: 30001, in_use: true },
            PortSlotInfo { port: 30002, in_use: false },
        ]);
        assert_eq!(pool.occupied(), vec![second]);
        assert!(pool.lease_for_port(30000).is_none());
        assert!(pool.lease_for_port(12345).is_none());
    }

    #[tokio::test]
    async fn test_wait_released() {
        let pool = Arc::new(PortPool::new(30000, 1).unwrap());
        let lease = pool.allocate().unwrap();

        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.wait_released(lease).await }
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        let _ = pool.release(lease);
        waiting.await.unwrap();

        // a stale lease resolves immediately, even with the slot in use again
        let _ = pool.allocate().unwrap();
        pool.wait_released(lease).await;
    }

    #[test]
    fn test_concurrent_allocation_never_exceeds_capacity() {
        let pool = PortPool::new(30000, 5).unwrap();

        let ports = std::thread::scope(|s| {
            let handles = (0..32)
                .map(|_| s.spawn(|| pool.allocate()))
                .collect::<Vec<_>>();
            handles.into_iter()
                .filter_map(|h| h.join().unwrap())
                .map(|lease| lease.port)
                .collect::<Vec<_>>()
        });

        assert_eq!(ports.len(), 5);
        assert_eq!(ports.iter().collect::<BTreeSet<_>>().len(), 5);
        assert_eq!(pool.count_in_use(), 5);
    }

    #[test]
    fn test_range_beyond_last_port_is_rejected() {
        assert!(PortPool::new(65534, 3).is_err());

        let pool = PortPool::new(65534, 2).unwrap();
        assert_eq!(pool.snapshot().last().unwrap().port, 65535);
    }
}
