use super::ServerCore;
use crate::callback::{dispatcher, CALLBACK_SUBSYSTEM};
use crate::error::{Fault, InvokeError};
use crate::handler::InvocationRequest;
use crate::net::UnifyBufStream;
use crate::proto::{read_frame, write_frame, Frame, FrameKind};
use futures::future::AbortHandle;
use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Control handle to one connection worker held by the pool
pub(crate) struct WorkerHandle {
    abort: AbortHandle,
    evicted: Arc<Notify>,
}

impl WorkerHandle {
    pub fn new(abort: AbortHandle, evicted: Arc<Notify>) -> Self {
        Self { abort, evicted }
    }

    /// Ask the worker to announce its eviction to the peer and exit
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    pub fn abort(&self) {
        self.abort.abort();
    }
}

struct Node {
    prev: Option<u64>,
    next: Option<u64>,
    handle: WorkerHandle,
}

struct PoolInner {
    nodes: HashMap<u64, Node>,
    /// Most recently active worker
    head: Option<u64>,
    /// Least recently active worker, the eviction candidate
    tail: Option<u64>,
}

/// Bounded set of connection workers with least-recently-used eviction.
///
/// Recency means frames processed, not connection age: `touch` on every
/// frame keeps chatty connections safe while an idle one ages toward the
/// tail. The list is id-linked through the node map so all operations stay
/// O(1) under one lock.
pub(crate) struct WorkerPool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner { nodes: HashMap::new(), head: None, tail: None }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    /// Admit a new worker; at capacity the least recently used one is
    /// removed and returned so the caller can evict it outside the lock.
    pub fn insert(&self, conn_id: u64, handle: WorkerHandle) -> Option<WorkerHandle> {
        let mut inner = self.inner.lock().unwrap();
        let mut evicted = None;
        if inner.nodes.len() >= self.capacity {
            if let Some(tail_id) = inner.tail {
                inner.unlink(tail_id);
                evicted = inner.nodes.remove(&tail_id).map(|n| n.handle);
                debug!("worker pool full, evicting conn {}", tail_id);
            }
        }
        inner.nodes.insert(conn_id, Node { prev: None, next: None, handle });
        inner.push_front(conn_id);
        evicted
    }

    /// Mark a worker as just-active
    pub fn touch(&self, conn_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.nodes.contains_key(&conn_id) && inner.head != Some(conn_id) {
            inner.unlink(conn_id);
            inner.push_front(conn_id);
        }
    }

    pub fn remove(&self, conn_id: u64) -> Option<WorkerHandle> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.nodes.contains_key(&conn_id) {
            return None;
        }
        inner.unlink(conn_id);
        inner.nodes.remove(&conn_id).map(|n| n.handle)
    }

    /// Pull every worker out for shutdown
    pub fn drain_all(&self) -> Vec<WorkerHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.head = None;
        inner.tail = None;
        inner.nodes.drain().map(|(_, n)| n.handle).collect()
    }
}

impl PoolInner {
    fn unlink(&mut self, id: u64) {
        let (prev, next) = match self.nodes.get(&id) {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.nodes.get_mut(&p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.nodes.get_mut(&nx) {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, id: u64) {
        let old_head = self.head;
        if let Some(n) = self.nodes.get_mut(&id) {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(o) = old_head {
            if let Some(n) = self.nodes.get_mut(&o) {
                n.prev = Some(id);
            }
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }
}

/// One accepted connection: read frames until the peer goes away, the idle
/// timeout fires, the error budget runs out, or the pool evicts us.
pub(crate) async fn run_worker(
    core: Arc<ServerCore>, mut stream: UnifyBufStream, conn_id: u64, evicted: Arc<Notify>,
) {
    let peer = stream.to_string();
    debug!("worker {} serving {}", conn_id, peer);
    let timeout = core.config.timeout;
    let mut errors: usize = 0;
    let mut last_seq: u64 = 0;

    loop {
        let frame = tokio::select! {
            r = read_frame(&mut stream, &core.codec, timeout.idle_timeout, timeout.read_timeout) => {
                match r {
                    Ok(f) => f,
                    Err(Fault::Timeout) => {
                        debug!("worker {} idle timeout", conn_id);
                        break;
                    }
                    Err(e) => {
                        trace!("worker {} read ended: {}", conn_id, e);
                        break;
                    }
                }
            }
            _ = evicted.notified() => {
                // echo the last-seen seq; a caller blocked on this
                // connection still surfaces the typed eviction fault
                let err = InvokeError::Fault(Fault::Evicted);
                let resp = Frame::error_response(last_seq, 0, &err);
                let _ = write_frame(&mut stream, &core.codec, &resp, timeout.write_timeout, true)
                    .await;
                info!("worker {} evicted", conn_id);
                break;
            }
        };
        core.workers.touch(conn_id);
        last_seq = frame.seq;

        match frame.kind {
            FrameKind::Ping => {
                let session = if frame.session == 0 {
                    let s = core.assign_session();
                    if frame.aux > 0 {
                        core.grant_lease(s, &peer, Duration::from_millis(frame.aux));
                    }
                    s
                } else {
                    let period =
                        if frame.aux > 0 { Some(Duration::from_millis(frame.aux)) } else { None };
                    core.leases.renew(frame.session, period);
                    frame.session
                };
                let pong = Frame::pong(frame.seq, session, core.secondary_available(session));
                if write_frame(&mut stream, &core.codec, &pong, timeout.write_timeout, true)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            FrameKind::Request => {
                core.leases.renew(frame.session, None);
                let result = if frame.name == CALLBACK_SUBSYSTEM {
                    dispatcher::handle_callback_op(&core, &frame).await
                } else {
                    dispatch_request(&core, &frame).await
                };
                let resp = match result {
                    Ok(body) => Frame::response(frame.seq, frame.session, body),
                    Err(err) => {
                        errors += 1;
                        Frame::error_response(frame.seq, frame.session, &err)
                    }
                };
                if write_frame(&mut stream, &core.codec, &resp, timeout.write_timeout, true)
                    .await
                    .is_err()
                {
                    break;
                }
                if errors > core.config.max_error_count {
                    warn!("worker {} exceeded {} errors, closing", conn_id, core.config.max_error_count);
                    break;
                }
            }
            FrameKind::Disconnect => {
                info!("worker {}: session {} disconnected", conn_id, frame.session);
                core.end_session(frame.session);
                break;
            }
            other => {
                trace!("worker {} ignoring {} frame", conn_id, other);
            }
        }
    }

    core.workers.remove(conn_id);
    let _ = stream.close().await;
    debug!("worker {} for {} done", conn_id, peer);
}

async fn dispatch_request(core: &Arc<ServerCore>, frame: &Frame) -> Result<Vec<u8>, InvokeError> {
    let Some(handler) = core.handler_for(&frame.name) else {
        return Err(Fault::Subsystem.into());
    };
    let req = InvocationRequest {
        subsystem: frame.name.clone(),
        session: frame.session,
        payload: frame.body.clone(),
        metadata: frame.meta.clone(),
    };
    trace!("dispatching {}", req);
    handler.invoke(req).await.map_err(InvokeError::Handler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> WorkerHandle {
        let (abort, _reg) = AbortHandle::new_pair();
        WorkerHandle::new(abort, Arc::new(Notify::new()))
    }

    fn tail_of(pool: &WorkerPool) -> Option<u64> {
        pool.inner.lock().unwrap().tail
    }

    #[test]
    fn test_lru_eviction_order() {
        let pool = WorkerPool::new(3);
        for id in 1..=3 {
            assert!(pool.insert(id, handle()).is_none());
        }
        assert_eq!(tail_of(&pool), Some(1));

        // full: inserting 4 evicts the oldest
        assert!(pool.insert(4, handle()).is_some());
        assert_eq!(pool.len(), 3);
        assert_eq!(tail_of(&pool), Some(2));
    }

    #[test]
    fn test_touch_promotes() {
        let pool = WorkerPool::new(3);
        for id in 1..=3 {
            pool.insert(id, handle());
        }
        // 1 was next in line; touching it moves 2 to the tail
        pool.touch(1);
        assert_eq!(tail_of(&pool), Some(2));
        pool.insert(4, handle());
        assert!(pool.remove(2).is_none());
        assert!(pool.remove(1).is_some());
    }

    #[test]
    fn test_remove_and_drain() {
        let pool = WorkerPool::new(4);
        for id in 1..=4 {
            pool.insert(id, handle());
        }
        assert!(pool.remove(3).is_some());
        assert!(pool.remove(3).is_none());
        assert_eq!(pool.len(), 3);

        let drained = pool.drain_all();
        assert_eq!(drained.len(), 3);
        assert_eq!(pool.len(), 0);
        assert_eq!(tail_of(&pool), None);
    }

    #[test]
    fn test_single_slot_pool() {
        let pool = WorkerPool::new(1);
        assert!(pool.insert(1, handle()).is_none());
        assert!(pool.insert(2, handle()).is_some());
        assert_eq!(pool.len(), 1);
        assert_eq!(tail_of(&pool), Some(2));
    }
}
