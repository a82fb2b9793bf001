mod lease;
pub(crate) mod pool;
mod poller;

use crate::callback::{
    CallbackEnvelope, CallbackOptions, ClientCallbackHandler, DeliveryMode, CALLBACK_SUBSYSTEM,
    META_ACK_REQUIRED, META_CALLBACK_ID, META_HANDLER_ID, META_MAX_ERRORS, META_MODE, META_OP,
    META_PUSH_LOCATOR, META_SUBSYSTEM, OP_ACK, OP_DRAIN, OP_REGISTER, OP_UNREGISTER,
};
use crate::codec::{Codec, MsgpCodec};
use crate::config::{ClientConfig, Metadata, ParamKey, Resolver, TimeoutSetting};
use crate::error::{Fault, InvokeError};
use crate::handler::ConnectionListener;
use crate::locator::Locator;
use crate::net::{UnifyAddr, UnifyBufStream, UnifyListener};
use crate::proto::{read_frame, write_frame, Frame, FrameKind};
use futures::future::{AbortHandle, Abortable};
use futures::FutureExt;
use lease::LeasePinger;
use log::*;
use pool::ConnPool;
use poller::CallbackPoller;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Locator/config-resolved settings, fixed at construction
struct EffectiveClientConfig {
    timeout: TimeoutSetting,
    max_pool_size: usize,
    lease_period: Option<Duration>,
    poll_period: Duration,
    policy: crate::config::OverridePolicy,
}

/// Transport client for one locator: owns the connection pool, the lease
/// pinger and any callback pollers/push acceptors.
///
/// `connect` / `invoke` / `disconnect` follow the documented lifecycle:
/// invoking while disconnected fails with `inv_closed`; any I/O failure
/// discards the connection it happened on and surfaces synchronously; no
/// automatic retry.
pub struct ClientInvoker {
    locator: Locator,
    effective: EffectiveClientConfig,
    codec: MsgpCodec,
    pool: Arc<ConnPool>,
    seq: Arc<AtomicU64>,
    connected: AtomicBool,
    session: AtomicU64,
    disconnect_sent: AtomicBool,
    listeners: Arc<Mutex<Vec<Arc<dyn ConnectionListener>>>>,
    pinger: Mutex<Option<LeasePinger>>,
    next_handler_id: AtomicU64,
    cb_handlers: Arc<Mutex<HashMap<u64, Arc<dyn ClientCallbackHandler>>>>,
    pollers: Mutex<HashMap<u64, CallbackPoller>>,
    push_acceptors: Mutex<HashMap<u64, AbortHandle>>,
    weak: Mutex<Weak<Self>>,
}

impl fmt::Display for ClientInvoker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "client invoker {}", self.locator)
    }
}

impl ClientInvoker {
    pub fn new(locator: Locator, config: ClientConfig) -> Result<Arc<Self>, InvokeError> {
        let resolver =
            Resolver::new(Some(&locator.params), Some(&config.params), None, config.policy);
        let mut timeout = config.timeout;
        if let Some(d) = resolver.get_millis(ParamKey::ReadTimeout)? {
            timeout.read_timeout = d;
        }
        if let Some(d) = resolver.get_millis(ParamKey::WriteTimeout)? {
            timeout.write_timeout = d;
        }
        if let Some(d) = resolver.get_millis(ParamKey::AcquireTimeout)? {
            timeout.acquire_timeout = d;
        }
        let effective = EffectiveClientConfig {
            timeout,
            max_pool_size: resolver
                .get_usize(ParamKey::MaxPoolSize)?
                .unwrap_or(config.max_pool_size),
            lease_period: resolver
                .get_millis(ParamKey::LeasePeriod)?
                .or(config.lease_period),
            poll_period: resolver
                .get_millis(ParamKey::PollPeriod)?
                .unwrap_or(config.poll_period),
            policy: config.policy,
        };
        let addr = locator.to_addr()?;
        let pool = Arc::new(ConnPool::new(addr, effective.max_pool_size, timeout));

        let invoker = Arc::new(Self {
            locator,
            effective,
            codec: MsgpCodec::default(),
            pool,
            seq: Arc::new(AtomicU64::new(1)),
            connected: AtomicBool::new(false),
            session: AtomicU64::new(0),
            disconnect_sent: AtomicBool::new(false),
            listeners: Arc::new(Mutex::new(Vec::new())),
            pinger: Mutex::new(None),
            next_handler_id: AtomicU64::new(1),
            cb_handlers: Arc::new(Mutex::new(HashMap::new())),
            pollers: Mutex::new(HashMap::new()),
            push_acceptors: Mutex::new(HashMap::new()),
            weak: Mutex::new(Weak::new()),
        });
        *invoker.weak.lock().unwrap() = Arc::downgrade(&invoker);
        Ok(invoker)
    }

    #[inline]
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The server-assigned session id; 0 before the first connect
    #[inline]
    pub fn session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Open the invoker: handshake for a session id and start the lease
    /// pinger when a lease period is configured. Idempotent.
    pub async fn connect(&self) -> Result<(), InvokeError> {
        if self.is_connected() {
            return Ok(());
        }
        self.pool.open();
        let ping = Frame::ping(self.next_seq(), 0, self.effective.lease_period);
        let resp = self.exchange(ping, self.effective.timeout.read_timeout).await?;
        if resp.kind != FrameKind::Pong {
            return Err(Fault::Internal.into());
        }
        self.session.store(resp.session, Ordering::Release);
        self.disconnect_sent.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        info!("{} connected, session {}", self, resp.session);

        if let Some(period) = self.effective.lease_period {
            let pinger = LeasePinger::start(
                self.pool.clone(),
                resp.session,
                period,
                self.seq.clone(),
                self.effective.timeout,
                self.listeners.clone(),
                self.locator.to_string(),
            );
            *self.pinger.lock().unwrap() = Some(pinger);
        }
        Ok(())
    }

    /// One remote invocation. Per-call metadata participates in parameter
    /// resolution (e.g. `read-timeout`), then travels to the handler.
    pub async fn invoke(
        &self, subsystem: &str, payload: Vec<u8>, metadata: Metadata,
    ) -> Result<Vec<u8>, InvokeError> {
        if !self.is_connected() {
            return Err(Fault::Closed.into());
        }
        let resolver =
            Resolver::new(Some(&self.locator.params), None, Some(&metadata), self.effective.policy);
        let read_timeout = resolver
            .get_millis(ParamKey::ReadTimeout)?
            .unwrap_or(self.effective.timeout.read_timeout);

        let frame =
            Frame::request(subsystem, self.next_seq(), self.session(), metadata, payload);
        let resp = self.exchange(frame, read_timeout).await?;
        if resp.is_error() {
            return Err(InvokeError::from_wire(&resp.body));
        }
        Ok(resp.body)
    }

    /// Full teardown: stop timers, notify the server, drain the pool
    pub async fn disconnect(&self) {
        self.do_disconnect(true).await
    }

    /// Local-only teardown, skipping the server notification; for fast
    /// client exit without a round trip. The server finds out via lease
    /// expiry.
    pub async fn disconnect_local(&self) {
        self.do_disconnect(false).await
    }

    async fn do_disconnect(&self, notify_server: bool) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(p) = self.pinger.lock().unwrap().take() {
            p.stop();
        }
        self.pollers.lock().unwrap().clear();
        let acceptors: Vec<AbortHandle> =
            self.push_acceptors.lock().unwrap().drain().map(|(_, a)| a).collect();
        for a in acceptors {
            a.abort();
        }
        if notify_server {
            if let Err(e) = self.terminate_lease().await {
                debug!("{}: disconnect notification failed: {}", self, e);
            }
        }
        self.pool.drain().await;
        info!("{} disconnected", self);
    }

    /// Tell the server to drop this session's lease. Sent at most once per
    /// connect; calling it again (or on a dead session) is a no-op.
    pub async fn terminate_lease(&self) -> Result<(), InvokeError> {
        if self.disconnect_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let session = self.session();
        if session == 0 {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        let frame = Frame::disconnect(session);
        let r = write_frame(
            &mut conn.stream,
            &self.codec,
            &frame,
            self.effective.timeout.write_timeout,
            true,
        )
        .await;
        match r {
            Ok(_) => {
                self.pool.release(conn);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Test hook: simulate a client that stops renewing without
    /// disconnecting, so the server's sweep expires the session.
    pub fn stop_lease_pinger(&self) {
        if let Some(p) = self.pinger.lock().unwrap().take() {
            p.stop();
        }
    }

    // ---- callback operations ----

    /// Register a callback handler with the server. Returns the handler id
    /// used by `get_callbacks`/`acknowledge`/`unregister_callbacks`.
    pub async fn register_callbacks(
        &self, subsystem: Option<&str>, opts: CallbackOptions,
        handler: Arc<dyn ClientCallbackHandler>,
    ) -> Result<u64, InvokeError> {
        if !self.is_connected() {
            return Err(Fault::Closed.into());
        }
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::AcqRel);
        let mut meta = Metadata::new();
        meta.insert(META_OP.to_string(), OP_REGISTER.to_string());
        meta.insert(META_MODE.to_string(), opts.mode.to_string());
        meta.insert(META_HANDLER_ID.to_string(), handler_id.to_string());
        meta.insert(META_ACK_REQUIRED.to_string(), opts.ack_required.to_string());
        if let Some(n) = opts.max_error_count {
            meta.insert(META_MAX_ERRORS.to_string(), n.to_string());
        }
        if let Some(s) = subsystem {
            meta.insert(META_SUBSYSTEM.to_string(), s.to_string());
        }

        if opts.mode == DeliveryMode::Push
            && self.locator.transport != crate::bisocket::BISOCKET_TRANSPORT
        {
            // socket transport: we must be dialable, so open a one-purpose
            // listener and advertise it
            let push_locator = self.start_push_acceptor(handler_id).await?;
            meta.insert(META_PUSH_LOCATOR.to_string(), push_locator);
        }
        self.cb_handlers.lock().unwrap().insert(handler_id, handler.clone());

        let frame =
            Frame::request(CALLBACK_SUBSYSTEM, self.next_seq(), self.session(), meta, Vec::new());
        match self.exchange(frame, self.effective.timeout.read_timeout).await {
            Ok(resp) if !resp.is_error() => {}
            Ok(resp) => {
                self.cleanup_registration(handler_id);
                return Err(InvokeError::from_wire(&resp.body));
            }
            Err(e) => {
                self.cleanup_registration(handler_id);
                return Err(e);
            }
        }

        if opts.mode == DeliveryMode::Poll {
            let period = opts.poll_period.unwrap_or(self.effective.poll_period);
            let poller = CallbackPoller::start(
                self.weak.lock().unwrap().clone(),
                handler_id,
                handler,
                period,
                opts.ack_required,
            );
            self.pollers.lock().unwrap().insert(handler_id, poller);
        }
        Ok(handler_id)
    }

    pub async fn unregister_callbacks(&self, handler_id: u64) -> Result<(), InvokeError> {
        let mut meta = Metadata::new();
        meta.insert(META_OP.to_string(), OP_UNREGISTER.to_string());
        meta.insert(META_HANDLER_ID.to_string(), handler_id.to_string());
        let frame =
            Frame::request(CALLBACK_SUBSYSTEM, self.next_seq(), self.session(), meta, Vec::new());
        let resp = self.exchange(frame, self.effective.timeout.read_timeout).await?;
        self.cleanup_registration(handler_id);
        if resp.is_error() {
            return Err(InvokeError::from_wire(&resp.body));
        }
        Ok(())
    }

    /// PULL-mode drain; each pending callback is returned exactly once
    pub async fn get_callbacks(
        &self, handler_id: u64,
    ) -> Result<Vec<CallbackEnvelope>, InvokeError> {
        if !self.is_connected() {
            return Err(Fault::Closed.into());
        }
        let mut meta = Metadata::new();
        meta.insert(META_OP.to_string(), OP_DRAIN.to_string());
        meta.insert(META_HANDLER_ID.to_string(), handler_id.to_string());
        let frame =
            Frame::request(CALLBACK_SUBSYSTEM, self.next_seq(), self.session(), meta, Vec::new());
        let resp = self.exchange(frame, self.effective.timeout.read_timeout).await?;
        if resp.is_error() {
            return Err(InvokeError::from_wire(&resp.body));
        }
        if resp.body.is_empty() {
            return Ok(Vec::new());
        }
        self.codec.decode(&resp.body).map_err(|_| Fault::Decode.into())
    }

    /// Application-level acknowledgement carrying the handler's response
    pub async fn acknowledge(
        &self, handler_id: u64, callback_id: u64, response: Vec<u8>,
    ) -> Result<(), InvokeError> {
        let mut meta = Metadata::new();
        meta.insert(META_OP.to_string(), OP_ACK.to_string());
        meta.insert(META_HANDLER_ID.to_string(), handler_id.to_string());
        meta.insert(META_CALLBACK_ID.to_string(), callback_id.to_string());
        let frame =
            Frame::request(CALLBACK_SUBSYSTEM, self.next_seq(), self.session(), meta, response);
        let resp = self.exchange(frame, self.effective.timeout.read_timeout).await?;
        if resp.is_error() {
            return Err(InvokeError::from_wire(&resp.body));
        }
        Ok(())
    }

    /// Liveness probe doubling as a lease renewal; returns the Pong aux
    /// word (secondary availability on bisocket servers)
    pub(crate) async fn ping(&self) -> Result<u64, InvokeError> {
        let frame = Frame::ping(self.next_seq(), self.session(), self.effective.lease_period);
        let resp = self.exchange(frame, self.effective.timeout.read_timeout).await?;
        if resp.kind != FrameKind::Pong {
            return Err(Fault::Internal.into());
        }
        Ok(resp.aux)
    }

    // ---- internals ----

    #[inline]
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn callback_handlers(
        &self,
    ) -> Arc<Mutex<HashMap<u64, Arc<dyn ClientCallbackHandler>>>> {
        self.cb_handlers.clone()
    }

    pub(crate) fn effective_timeout(&self) -> TimeoutSetting {
        self.effective.timeout
    }

    fn cleanup_registration(&self, handler_id: u64) {
        self.cb_handlers.lock().unwrap().remove(&handler_id);
        self.pollers.lock().unwrap().remove(&handler_id);
        if let Some(a) = self.push_acceptors.lock().unwrap().remove(&handler_id) {
            a.abort();
        }
    }

    /// One round trip over a borrowed pooled connection. A healthy exchange
    /// returns the connection to the pool; any transport failure discards
    /// it (guard dropped without release).
    async fn exchange(&self, frame: Frame, read_timeout: Duration) -> Result<Frame, InvokeError> {
        let mut conn = self.pool.acquire().await?;
        let seq = frame.seq;
        let r: Result<Frame, Fault> = async {
            write_frame(
                &mut conn.stream,
                &self.codec,
                &frame,
                self.effective.timeout.write_timeout,
                true,
            )
            .await?;
            let resp =
                read_frame(&mut conn.stream, &self.codec, read_timeout, read_timeout).await?;
            if resp.seq != seq {
                // an out-of-band fault (eviction notice) can arrive in
                // place of the awaited response; surface it as itself
                if resp.is_error() {
                    if let InvokeError::Fault(fault) = InvokeError::from_wire(&resp.body) {
                        return Err(fault);
                    }
                }
                warn!("{}: seq mismatch, got {} want {}", self, resp.seq, seq);
                return Err(Fault::Internal);
            }
            Ok(resp)
        }
        .await;
        match r {
            Ok(resp) => {
                self.pool.release(conn);
                Ok(resp)
            }
            Err(fault) => {
                debug!("{}: exchange failed: {}", self, fault);
                Err(fault.into())
            }
        }
    }

    /// Bind an ephemeral listener for PUSH callbacks and return its
    /// advertisable locator URI. The listener binds the local address of the
    /// control connection, which is the one address of ours the server can
    /// reach back.
    async fn start_push_acceptor(&self, handler_id: u64) -> Result<String, InvokeError> {
        let ip = {
            let conn = self.pool.acquire().await?;
            let ip = match conn.stream.local_addr() {
                Ok(UnifyAddr::Socket(a)) => a.ip(),
                _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
            };
            self.pool.release(conn);
            ip
        };
        let listener = UnifyListener::bind(&UnifyAddr::Socket(SocketAddr::new(ip, 0)))
            .await
            .map_err(|e| InvokeError::config(format!("push listener bind failed: {:?}", e)))?;
        let port = listener.local_port().map_err(InvokeError::from)?;
        let uri = format!("tcp://{}:{}", ip, port);

        let handlers = self.cb_handlers.clone();
        let timeout = self.effective.timeout;
        let (abort, reg) = AbortHandle::new_pair();
        let task = Abortable::new(
            async move {
                loop {
                    match listener.accept().await {
                        Ok(stream) => {
                            let handlers = handlers.clone();
                            tokio::spawn(async move {
                                run_push_reader(UnifyBufStream::new(stream), handlers, timeout)
                                    .await;
                            });
                        }
                        Err(e) => {
                            warn!("push acceptor error: {:?}", e);
                            return;
                        }
                    }
                }
            },
            reg,
        )
        .map(|_| ());
        tokio::spawn(task);
        self.push_acceptors.lock().unwrap().insert(handler_id, abort);
        debug!("{}: push acceptor for handler {} on {}", self, handler_id, uri);
        Ok(uri)
    }
}

/// Consume server-pushed frames on a dedicated connection: dispatch
/// `CallbackPush` to the registered handler, answer runtime acks and pings.
/// Shared by the socket push acceptor and bisocket secondary connections.
pub(crate) async fn run_push_reader(
    mut stream: UnifyBufStream,
    handlers: Arc<Mutex<HashMap<u64, Arc<dyn ClientCallbackHandler>>>>, timeout: TimeoutSetting,
) {
    let codec = MsgpCodec::default();
    loop {
        // block forever on the head; push channels are idle most of the time
        let frame =
            match read_frame(&mut stream, &codec, Duration::ZERO, timeout.read_timeout).await {
                Ok(f) => f,
                Err(e) => {
                    debug!("push reader exit: {}", e);
                    return;
                }
            };
        match frame.kind {
            FrameKind::CallbackPush => {
                let Ok(handler_id) = frame.name.parse::<u64>() else {
                    warn!("push frame with bad handler id {:?}", frame.name);
                    continue;
                };
                let callback = match codec.decode(&frame.body) {
                    Ok(cb) => cb,
                    Err(_) => {
                        warn!("push frame body decode failed for handler {}", handler_id);
                        continue;
                    }
                };
                let envelope = CallbackEnvelope { id: frame.aux, callback };
                let handler = handlers.lock().unwrap().get(&handler_id).cloned();
                let response = match handler {
                    Some(h) => match h.handle_callback(envelope) {
                        Ok(v) => v,
                        Err(text) => text.into_bytes(),
                    },
                    None => {
                        warn!("push for unknown handler {}", handler_id);
                        Vec::new()
                    }
                };
                if frame.need_ack() {
                    let ack =
                        Frame::callback_ack(handler_id, frame.session, frame.aux, response);
                    if write_frame(&mut stream, &codec, &ack, timeout.write_timeout, true)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            FrameKind::Ping => {
                let pong = Frame::pong(frame.seq, frame.session, 0);
                if write_frame(&mut stream, &codec, &pong, timeout.write_timeout, true)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            other => {
                trace!("push reader ignoring {} frame", other);
            }
        }
    }
}
