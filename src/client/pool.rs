use crate::config::TimeoutSetting;
use crate::error::Fault;
use crate::net::{UnifyAddr, UnifyBufStream, UnifyStream};
use log::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

/// Bounded pool of point-to-point connections to one locator.
///
/// Capacity is a semaphore: holding a [PooledConn] holds a permit, so no
/// two callers can ever borrow the same underlying connection. Dropping a
/// guard without releasing it discards the connection (socket closed) while
/// still returning the permit, which is exactly the failure path: a
/// connection that saw an I/O error must not rejoin the idle list.
pub(crate) struct ConnPool {
    addr: UnifyAddr,
    timeout: TimeoutSetting,
    idle: Mutex<Vec<UnifyBufStream>>,
    sem: Arc<Semaphore>,
    closed: AtomicBool,
}

/// One borrowed connection; exclusive by construction
#[derive(Debug)]
pub(crate) struct PooledConn {
    pub stream: UnifyBufStream,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Display for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pool to {}", self.addr)
    }
}

impl ConnPool {
    pub fn new(addr: UnifyAddr, max_size: usize, timeout: TimeoutSetting) -> Self {
        Self {
            addr,
            timeout,
            idle: Mutex::new(Vec::with_capacity(max_size)),
            sem: Arc::new(Semaphore::new(max_size.max(1))),
            closed: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Borrow an idle connection or dial a new one below capacity; at
    /// capacity, wait up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConn, Fault> {
        if !self.is_open() {
            return Err(Fault::Closed);
        }
        let permit = match timeout(self.timeout.acquire_timeout, self.sem.clone().acquire_owned())
            .await
        {
            Err(_) => {
                debug!("{}: acquire timed out", self);
                return Err(Fault::Timeout);
            }
            Ok(Err(_)) => return Err(Fault::Closed),
            Ok(Ok(p)) => p,
        };
        // the close flag may have flipped while we waited
        if !self.is_open() {
            return Err(Fault::Closed);
        }
        if let Some(stream) = self.idle.lock().unwrap().pop() {
            return Ok(PooledConn { stream, _permit: permit });
        }
        match UnifyStream::connect_timeout(&self.addr, self.timeout.acquire_timeout).await {
            Ok(stream) => {
                trace!("{}: dialed new connection", self);
                Ok(PooledConn { stream: UnifyBufStream::new(stream), _permit: permit })
            }
            Err(e) => {
                debug!("{}: connect failed: {:?}", self, e);
                Err(Fault::Unreachable)
            }
        }
    }

    /// Return a healthy connection for reuse
    pub fn release(&self, conn: PooledConn) {
        if self.is_open() {
            self.idle.lock().unwrap().push(conn.stream);
        }
        // permit drops with the guard either way
    }

    /// Close every idle member and stop handing out connections. Borrowed
    /// connections die when their guards drop.
    pub async fn drain(&self) {
        self.closed.store(true, Ordering::Release);
        let conns: Vec<UnifyBufStream> = self.idle.lock().unwrap().drain(..).collect();
        let n = conns.len();
        for mut stream in conns {
            let _ = stream.close().await;
        }
        if n > 0 {
            debug!("{}: drained {} idle connections", self, n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn short_timeouts() -> TimeoutSetting {
        TimeoutSetting { acquire_timeout: Duration::from_millis(200), ..Default::default() }
    }

    #[test]
    fn test_capacity_bound_and_exclusive_borrow() {
        rt().block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            // keep accepted sockets alive so the pool's dials succeed
            tokio::spawn(async move {
                let mut held = Vec::new();
                while let Ok((s, _)) = listener.accept().await {
                    held.push(s);
                }
            });

            let pool =
                ConnPool::new(UnifyAddr::from_str(&addr.to_string()).unwrap(), 2, short_timeouts());
            pool.open();

            let a = pool.acquire().await.expect("first");
            let b = pool.acquire().await.expect("second");
            // at capacity: third borrow times out instead of sharing
            assert_eq!(pool.acquire().await.unwrap_err(), Fault::Timeout);

            pool.release(a);
            let c = pool.acquire().await.expect("after release");
            drop(b);
            drop(c);
        });
    }

    #[test]
    fn test_closed_pool_rejects() {
        rt().block_on(async {
            let pool = ConnPool::new(
                UnifyAddr::from_str("127.0.0.1:1").unwrap(),
                2,
                short_timeouts(),
            );
            assert_eq!(pool.acquire().await.unwrap_err(), Fault::Closed);
            pool.open();
            // port 1 refuses: surfaced as unreachable, not closed
            assert_eq!(pool.acquire().await.unwrap_err(), Fault::Unreachable);
            pool.drain().await;
            assert_eq!(pool.acquire().await.unwrap_err(), Fault::Closed);
        });
    }

    #[test]
    fn test_discard_does_not_refill_idle() {
        rt().block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let mut held = Vec::new();
                while let Ok((s, _)) = listener.accept().await {
                    held.push(s);
                }
            });

            let pool =
                ConnPool::new(UnifyAddr::from_str(&addr.to_string()).unwrap(), 1, short_timeouts());
            pool.open();
            let a = pool.acquire().await.expect("acquire");
            drop(a); // simulated transport failure: discard, not release
            assert_eq!(pool.idle.lock().unwrap().len(), 0);
            // capacity is available again
            let b = pool.acquire().await.expect("reacquire");
            drop(b);
        });
    }
}
