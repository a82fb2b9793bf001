pub(crate) mod lease;
pub(crate) mod worker;

use crate::callback::dispatcher::{DialConnector, PushConnector};
use crate::callback::{CallbackRegistry, CallbackSink, Registration};
use crate::codec::MsgpCodec;
use crate::config::{ParamKey, Resolver, ServerConfig};
use crate::error::{Fault, InvokeError};
use crate::handler::{ConnectionListener, InvocationHandler, SessionInfo};
use crate::locator::Locator;
use crate::net::{UnifyAddr, UnifyBufStream, UnifyListener};
use futures::future::{AbortHandle, Abortable};
use futures::FutureExt;
use lease::LeaseTable;
use log::*;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use worker::{run_worker, WorkerHandle, WorkerPool};

/// Shared state behind one server invoker: its handlers, leases, callback
/// registrations and the worker pool. Workers and the callback dispatcher
/// hold this, never the invoker itself.
pub(crate) struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) codec: MsgpCodec,
    pub(crate) leases: Arc<LeaseTable>,
    pub(crate) workers: WorkerPool,
    pub(crate) callbacks: Arc<CallbackRegistry>,
    handlers: RwLock<HashMap<String, Arc<dyn InvocationHandler>>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    /// peer address per live session, for listener notifications
    peers: Mutex<HashMap<u64, String>>,
    next_session: AtomicU64,
    next_conn: AtomicU64,
    push_connector: Mutex<Arc<dyn PushConnector>>,
}

impl ServerCore {
    pub fn assign_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::AcqRel)
    }

    /// Only leased sessions record their peer: the map exists for the
    /// expiry notification, and both lease exits (terminate, expiry) clear
    /// the entry. Anonymous sessions leave no server-side state behind.
    pub fn grant_lease(&self, session: u64, peer: &str, period: Duration) {
        self.peers.lock().unwrap().insert(session, peer.to_string());
        self.leases.grant(session, period);
    }

    #[inline]
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::AcqRel)
    }

    pub fn handler_for(&self, subsystem: &str) -> Option<Arc<dyn InvocationHandler>> {
        self.handlers.read().unwrap().get(subsystem).cloned()
    }

    pub fn push_connector(&self) -> Arc<dyn PushConnector> {
        self.push_connector.lock().unwrap().clone()
    }

    pub fn set_push_connector(&self, connector: Arc<dyn PushConnector>) {
        *self.push_connector.lock().unwrap() = connector;
    }

    #[inline]
    pub fn secondary_available(&self, session: u64) -> u64 {
        self.push_connector().available(session)
    }

    pub fn callbacks_shared(&self) -> Arc<CallbackRegistry> {
        self.callbacks.clone()
    }

    /// Hand the registration's sink to the handler(s) it targets
    pub fn attach_sink(&self, reg: &Arc<Registration>) {
        let handlers = self.handlers.read().unwrap();
        match &reg.subsystem {
            Some(name) => {
                if let Some(h) = handlers.get(name) {
                    h.add_listener(CallbackSink::new(reg.clone()));
                }
            }
            None => {
                for h in handlers.values() {
                    h.add_listener(CallbackSink::new(reg.clone()));
                }
            }
        }
    }

    pub fn detach_sink(&self, reg: &Arc<Registration>) {
        let handlers = self.handlers.read().unwrap();
        match &reg.subsystem {
            Some(name) => {
                if let Some(h) = handlers.get(name) {
                    h.remove_listener(reg.handler_id);
                }
            }
            None => {
                for h in handlers.values() {
                    h.remove_listener(reg.handler_id);
                }
            }
        }
    }

    /// Clean teardown on an explicit Disconnect; listeners stay quiet
    pub fn end_session(&self, session: u64) {
        self.leases.terminate(session);
        self.peers.lock().unwrap().remove(&session);
        for reg in self.callbacks.teardown_session(session) {
            self.detach_sink(&reg);
        }
    }

    /// Lease expiry: cascade the callback teardown and tell every
    /// connection listener, once.
    pub fn expire_session(&self, session: u64) {
        let peer = self.peers.lock().unwrap().remove(&session).unwrap_or_default();
        for reg in self.callbacks.teardown_session(session) {
            self.detach_sink(&reg);
        }
        let info = SessionInfo { session, peer };
        let err = InvokeError::Fault(Fault::Timeout);
        for l in self.listeners.lock().unwrap().iter() {
            l.connection_failed(&err, &info);
        }
    }
}

/// Listening side of the runtime: binds the locator, accepts connections
/// into the LRU worker pool and runs the lease sweeper.
pub struct ServerInvoker {
    locator: Locator,
    core: Arc<ServerCore>,
    started: AtomicBool,
    accept_abort: Mutex<Option<AbortHandle>>,
    sweeper_abort: Mutex<Option<AbortHandle>>,
    bound: Mutex<Option<UnifyAddr>>,
}

impl fmt::Display for ServerInvoker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "server invoker {}", self.locator)
    }
}

impl ServerInvoker {
    pub fn new(locator: Locator, config: ServerConfig) -> Result<Arc<Self>, InvokeError> {
        let core = Self::build_core(&locator, config)?;
        Ok(Arc::new(Self {
            locator,
            core,
            started: AtomicBool::new(false),
            accept_abort: Mutex::new(None),
            sweeper_abort: Mutex::new(None),
            bound: Mutex::new(None),
        }))
    }

    pub(crate) fn build_core(
        locator: &Locator, config: ServerConfig,
    ) -> Result<Arc<ServerCore>, InvokeError> {
        let params = config.params.clone();
        let resolver = Resolver::new(Some(&locator.params), Some(&params), None, config.policy);
        let mut effective = config;
        if let Some(d) = resolver.get_millis(ParamKey::ReadTimeout)? {
            effective.timeout.read_timeout = d;
        }
        if let Some(d) = resolver.get_millis(ParamKey::WriteTimeout)? {
            effective.timeout.write_timeout = d;
        }
        if let Some(d) = resolver.get_millis(ParamKey::IdleTimeout)? {
            effective.timeout.idle_timeout = d;
        }
        if let Some(n) = resolver.get_usize(ParamKey::MaxWorkerPoolSize)? {
            effective.max_worker_pool_size = n;
        }
        if let Some(n) = resolver.get_usize(ParamKey::MaxErrorCount)? {
            effective.max_error_count = n;
        }
        let workers = WorkerPool::new(effective.max_worker_pool_size);
        let dialer = Arc::new(DialConnector::new(effective.timeout));
        Ok(Arc::new(ServerCore {
            config: effective,
            codec: MsgpCodec::default(),
            leases: Arc::new(LeaseTable::new()),
            workers,
            callbacks: Arc::new(CallbackRegistry::new()),
            handlers: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            next_conn: AtomicU64::new(1),
            push_connector: Mutex::new(dialer),
        }))
    }

    pub fn add_invocation_handler(&self, subsystem: &str, handler: Arc<dyn InvocationHandler>) {
        self.core
            .handlers
            .write()
            .unwrap()
            .insert(subsystem.to_string(), handler);
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.core.listeners.lock().unwrap().push(listener);
    }

    /// Observe delivery outcomes of one callback registration; false when
    /// the registration is unknown or already torn down
    pub fn set_callback_listener(
        &self, handler_id: u64, listener: Arc<dyn crate::callback::CallbackListener>,
    ) -> bool {
        match self.core.callbacks.get(handler_id) {
            Some(reg) => {
                reg.set_listener(listener);
                true
            }
            None => false,
        }
    }

    pub(crate) fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Port actually bound, which differs from the locator's when it asked
    /// for an ephemeral one
    pub fn bound_port(&self) -> Option<u16> {
        match self.bound.lock().unwrap().as_ref() {
            Some(UnifyAddr::Socket(a)) => Some(a.port()),
            _ => None,
        }
    }

    /// Bind and start accepting; idempotent
    pub async fn start(&self) -> Result<(), InvokeError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let addr = self.locator.to_addr()?;
        let listener = UnifyListener::bind(&addr).await.map_err(|e| {
            self.started.store(false, Ordering::Release);
            error!("{}: bind failed: {:?}", self, e);
            InvokeError::Fault(Fault::Unreachable)
        })?;
        let bound = listener.local_addr().map_err(InvokeError::from)?;
        info!("{} listening on {}", self, bound);
        *self.bound.lock().unwrap() = Some(bound);

        let weak = Arc::downgrade(&self.core);
        let sweeper = self.core.leases.run_sweeper(move |session| {
            if let Some(core) = weak.upgrade() {
                core.expire_session(session);
            }
        });
        *self.sweeper_abort.lock().unwrap() = Some(sweeper);

        let core = self.core.clone();
        let (abort, reg) = AbortHandle::new_pair();
        let task = Abortable::new(
            async move {
                loop {
                    match listener.accept().await {
                        Ok(stream) => {
                            let conn_id = core.next_conn_id();
                            let evicted = Arc::new(Notify::new());
                            let (wabort, wreg) = AbortHandle::new_pair();
                            let handle = WorkerHandle::new(wabort, evicted.clone());
                            if let Some(old) = core.workers.insert(conn_id, handle) {
                                old.evict();
                            }
                            let wcore = core.clone();
                            let buf = UnifyBufStream::new(stream);
                            tokio::spawn(
                                Abortable::new(run_worker(wcore, buf, conn_id, evicted), wreg)
                                    .map(|_| ()),
                            );
                        }
                        Err(e) => {
                            error!("accept failed: {:?}", e);
                            return;
                        }
                    }
                }
            },
            reg,
        )
        .map(|_| ());
        tokio::spawn(task);
        *self.accept_abort.lock().unwrap() = Some(abort);
        Ok(())
    }

    /// Stop accepting, give in-flight workers a moment to finish, then cut
    /// them off. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(a) = self.accept_abort.lock().unwrap().take() {
            a.abort();
        }
        if let Some(a) = self.sweeper_abort.lock().unwrap().take() {
            a.abort();
        }
        for _ in 0..20 {
            if self.core.workers.len() == 0 {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        let stragglers = self.core.workers.drain_all();
        if !stragglers.is_empty() {
            debug!("{}: aborting {} workers", self, stragglers.len());
            for h in stragglers {
                h.abort();
            }
        }
        info!("{} stopped", self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn core() -> Arc<ServerCore> {
        let locator = Locator::from_str("tcp://127.0.0.1:0").unwrap();
        ServerInvoker::build_core(&locator, ServerConfig::default()).unwrap()
    }

    #[test]
    fn test_anonymous_session_records_no_peer() {
        let core = core();
        let s = core.assign_session();
        assert!(core.peers.lock().unwrap().is_empty());
        core.end_session(s);
        assert!(core.peers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_leased_session_peer_lifecycle() {
        let core = core();
        let s = core.assign_session();
        core.grant_lease(s, "127.0.0.1:50000", Duration::from_millis(500));
        assert!(core.peers.lock().unwrap().contains_key(&s));

        core.end_session(s);
        assert!(core.peers.lock().unwrap().is_empty());
        assert!(!core.leases.contains(s));
    }

    #[test]
    fn test_expiry_clears_peer_entry() {
        let core = core();
        let s = core.assign_session();
        core.grant_lease(s, "127.0.0.1:50001", Duration::from_millis(500));
        core.expire_session(s);
        assert!(core.peers.lock().unwrap().is_empty());
    }
}
