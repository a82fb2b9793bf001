use futures::future::{AbortHandle, Abortable};
use futures::FutureExt;
use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::sleep;

/// Slack multiplier on the granted period before a lease counts as expired,
/// so one lost renewal ping does not kill the session.
const EXPIRY_FACTOR: u32 = 2;

struct Lease {
    period: Duration,
    renewed: Instant,
}

impl Lease {
    #[inline]
    fn deadline(&self) -> Instant {
        self.renewed + self.period * EXPIRY_FACTOR
    }
}

/// All granted leases of one server invoker.
///
/// The sweeper sleeps until the earliest deadline; any grant or terminate
/// pokes it through `changed` so a newly granted short lease is never missed.
pub(crate) struct LeaseTable {
    inner: Mutex<HashMap<u64, Lease>>,
    changed: Notify,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()), changed: Notify::new() }
    }

    pub fn grant(&self, session: u64, period: Duration) {
        debug!("lease granted for session {} period {:?}", session, period);
        self.inner
            .lock()
            .unwrap()
            .insert(session, Lease { period, renewed: Instant::now() });
        self.changed.notify_one();
    }

    /// Touch a lease; any traffic from the session counts as renewal. An
    /// explicit period (from a Ping) replaces the granted one. Unknown or
    /// already expired sessions are ignored.
    pub fn renew(&self, session: u64, period: Option<Duration>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(lease) = inner.get_mut(&session) {
            lease.renewed = Instant::now();
            if let Some(p) = period {
                if p != lease.period {
                    lease.period = p;
                    drop(inner);
                    self.changed.notify_one();
                }
            }
        }
    }

    #[inline]
    pub fn contains(&self, session: u64) -> bool {
        self.inner.lock().unwrap().contains_key(&session)
    }

    /// Drop a lease without expiry semantics (explicit disconnect).
    /// Idempotent; returns whether the lease was still live.
    pub fn terminate(&self, session: u64) -> bool {
        let removed = self.inner.lock().unwrap().remove(&session).is_some();
        if removed {
            debug!("lease terminated for session {}", session);
            self.changed.notify_one();
        }
        removed
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.inner.lock().unwrap().values().map(Lease::deadline).min()
    }

    /// Remove and return every lease past its deadline. Removal happens
    /// under the lock before anyone is told, so each expiry is observed
    /// exactly once.
    fn take_expired(&self) -> Vec<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<u64> =
            inner.iter().filter(|(_, l)| l.deadline() <= now).map(|(s, _)| *s).collect();
        for session in &expired {
            inner.remove(session);
        }
        expired
    }

    /// Background expiry sweep; `on_expire` fires once per dead session
    pub fn run_sweeper<F>(self: &Arc<Self>, on_expire: F) -> AbortHandle
    where
        F: Fn(u64) + Send + 'static,
    {
        let table = self.clone();
        let (abort, reg) = AbortHandle::new_pair();
        let task = Abortable::new(
            async move {
                loop {
                    match table.earliest_deadline() {
                        Some(deadline) => {
                            let wait = deadline.saturating_duration_since(Instant::now());
                            tokio::select! {
                                _ = sleep(wait) => {}
                                _ = table.changed.notified() => continue,
                            }
                        }
                        None => {
                            table.changed.notified().await;
                            continue;
                        }
                    }
                    for session in table.take_expired() {
                        info!("lease expired for session {}", session);
                        on_expire(session);
                    }
                }
            },
            reg,
        )
        .map(|_| ());
        tokio::spawn(task);
        abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_expiry_fires_exactly_once() {
        rt().block_on(async {
            let table = Arc::new(LeaseTable::new());
            let fired = Arc::new(AtomicUsize::new(0));
            let counter = fired.clone();
            let sweeper = table.run_sweeper(move |session| {
                assert_eq!(session, 5);
                counter.fetch_add(1, Ordering::AcqRel);
            });

            table.grant(5, Duration::from_millis(50));
            sleep(Duration::from_millis(300)).await;
            assert_eq!(fired.load(Ordering::Acquire), 1);
            assert!(!table.contains(5));
            sweeper.abort();
        });
    }

    #[test]
    fn test_renewal_defers_expiry() {
        rt().block_on(async {
            let table = Arc::new(LeaseTable::new());
            let fired = Arc::new(AtomicUsize::new(0));
            let counter = fired.clone();
            let sweeper = table.run_sweeper(move |_| {
                counter.fetch_add(1, Ordering::AcqRel);
            });

            table.grant(9, Duration::from_millis(100));
            for _ in 0..4 {
                sleep(Duration::from_millis(60)).await;
                table.renew(9, None);
            }
            assert_eq!(fired.load(Ordering::Acquire), 0);
            assert!(table.contains(9));
            sweeper.abort();
        });
    }

    #[test]
    fn test_terminate_beats_expiry() {
        rt().block_on(async {
            let table = Arc::new(LeaseTable::new());
            let fired = Arc::new(AtomicUsize::new(0));
            let counter = fired.clone();
            let sweeper = table.run_sweeper(move |_| {
                counter.fetch_add(1, Ordering::AcqRel);
            });

            table.grant(3, Duration::from_millis(80));
            assert!(table.terminate(3));
            assert!(!table.terminate(3));
            sleep(Duration::from_millis(250)).await;
            assert_eq!(fired.load(Ordering::Acquire), 0);
            sweeper.abort();
        });
    }
}
