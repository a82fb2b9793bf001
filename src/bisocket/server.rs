use super::BisocketConfig;
use crate::callback::dispatcher::PushConnector;
use crate::codec::MsgpCodec;
use crate::config::{ParamKey, ServerConfig};
use crate::error::{Fault, InvokeError};
use crate::handler::{ConnectionListener, InvocationHandler};
use crate::locator::Locator;
use crate::net::{UnifyAddr, UnifyBufStream, UnifyListener};
use crate::proto::{read_frame, write_frame, Frame, FrameKind};
use crate::server::ServerInvoker;
use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use futures::FutureExt;
use log::*;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

/// Client-attached connections parked per control session until a push
/// registration claims one.
pub(crate) struct SecondaryPool {
    inner: Mutex<HashMap<u64, VecDeque<UnifyBufStream>>>,
    arrived: Notify,
}

impl SecondaryPool {
    fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()), arrived: Notify::new() }
    }

    fn offer(&self, session: u64, stream: UnifyBufStream) {
        self.inner.lock().unwrap().entry(session).or_default().push_back(stream);
        self.arrived.notify_waiters();
    }

    fn available(&self, session: u64) -> u64 {
        self.inner.lock().unwrap().get(&session).map(|q| q.len() as u64).unwrap_or(0)
    }

    fn pop(&self, session: u64) -> Option<UnifyBufStream> {
        self.inner.lock().unwrap().get_mut(&session).and_then(|q| q.pop_front())
    }

    /// Take one parked secondary for `session`, waiting up to `timeout`
    /// for the client to attach one. Interest in `arrived` is registered
    /// before each pool check, so an offer landing in between is not lost.
    async fn claim(&self, session: u64, timeout: Duration) -> Result<UnifyBufStream, Fault> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(stream) = self.pop(session) {
                return Ok(stream);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                _ = sleep(deadline - now) => break,
                _ = notified => {}
            }
        }
        // an offer may race the deadline itself
        if let Some(stream) = self.pop(session) {
            return Ok(stream);
        }
        debug!("no secondary for session {} within {:?}", session, timeout);
        Err(Fault::Timeout)
    }

    fn take_all(&self) -> Vec<(u64, UnifyBufStream)> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for (session, queue) in inner.drain() {
            for stream in queue {
                out.push((session, stream));
            }
        }
        out
    }
}

/// PushConnector that claims a parked secondary instead of dialing back
struct SecondaryConnector {
    pool: Arc<SecondaryPool>,
    claim_timeout: Duration,
}

#[async_trait]
impl PushConnector for SecondaryConnector {
    async fn connect(
        &self, session: u64, _push_locator: Option<&str>,
    ) -> Result<UnifyBufStream, Fault> {
        let stream = self.pool.claim(session, self.claim_timeout).await?;
        debug!("claimed secondary for session {}", session);
        Ok(stream)
    }

    fn available(&self, session: u64) -> u64 {
        self.pool.available(session)
    }
}

/// Server invoker for the bisocket transport: the primary listener behaves
/// exactly like the socket transport's, plus one listener per secondary
/// bind port that parks attaching connections in the [SecondaryPool].
pub struct BisocketServerInvoker {
    inner: Arc<ServerInvoker>,
    bind_ports: Vec<u16>,
    connect_ports: Vec<u16>,
    ping_frequency: Duration,
    pool: Arc<SecondaryPool>,
    aborts: Mutex<Vec<AbortHandle>>,
    started: AtomicBool,
}

impl BisocketServerInvoker {
    pub fn new(locator: Locator, config: ServerConfig) -> Result<Arc<Self>, InvokeError> {
        let cfg = BisocketConfig::from_locator(&locator, &config.params)?;
        let inner = ServerInvoker::new(locator, config)?;
        let pool = Arc::new(SecondaryPool::new());
        inner.core().set_push_connector(Arc::new(SecondaryConnector {
            pool: pool.clone(),
            claim_timeout: cfg.claim_timeout,
        }));
        Ok(Arc::new(Self {
            inner,
            bind_ports: cfg.bind_ports,
            connect_ports: cfg.connect_ports,
            ping_frequency: cfg.ping_frequency,
            pool,
            aborts: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }

    pub fn add_invocation_handler(&self, subsystem: &str, handler: Arc<dyn InvocationHandler>) {
        self.inner.add_invocation_handler(subsystem, handler);
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.add_connection_listener(listener);
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.inner.bound_port()
    }

    pub fn set_callback_listener(
        &self, handler_id: u64, listener: Arc<dyn crate::callback::CallbackListener>,
    ) -> bool {
        self.inner.set_callback_listener(handler_id, listener)
    }

    /// The locator clients should dial: the server's own locator with the
    /// secondary ports advertised in bind order. The primary port reflects
    /// the actual binding once the server has started.
    pub fn secondary_locator(&self) -> Locator {
        let joined = self
            .connect_ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut locator = self.inner.locator().clone();
        if let Some(p) = self.inner.bound_port() {
            locator.port = p;
        }
        locator.with_param(ParamKey::SecondaryConnectPorts, &joined)
    }

    pub async fn start(&self) -> Result<(), InvokeError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.start().await?;
        let host = self.inner.locator().host.clone();
        let read_timeout = self.inner.core().config.timeout.read_timeout;

        for port in &self.bind_ports {
            let addr = UnifyAddr::from_str(&format!("{}:{}", host, port))
                .map_err(|_| InvokeError::config(format!("bad secondary host {:?}", host)))?;
            let listener = UnifyListener::bind(&addr).await.map_err(|e| {
                error!("secondary bind on {} failed: {:?}", addr, e);
                InvokeError::Fault(Fault::Unreachable)
            })?;
            info!("secondary listener on {}", addr);
            let pool = self.pool.clone();
            let (abort, reg) = AbortHandle::new_pair();
            let task = Abortable::new(
                async move {
                    loop {
                        match listener.accept().await {
                            Ok(stream) => {
                                let pool = pool.clone();
                                tokio::spawn(async move {
                                    park_secondary(UnifyBufStream::new(stream), pool, read_timeout)
                                        .await;
                                });
                            }
                            Err(e) => {
                                error!("secondary accept failed: {:?}", e);
                                return;
                            }
                        }
                    }
                },
                reg,
            )
            .map(|_| ());
            tokio::spawn(task);
            self.aborts.lock().unwrap().push(abort);
        }

        if self.ping_frequency > Duration::ZERO {
            let abort = run_secondary_monitor(
                self.pool.clone(),
                self.ping_frequency,
                read_timeout,
            );
            self.aborts.lock().unwrap().push(abort);
        }
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let aborts: Vec<AbortHandle> = self.aborts.lock().unwrap().drain(..).collect();
        for a in aborts {
            a.abort();
        }
        for (_, mut stream) in self.pool.take_all() {
            let _ = stream.close().await;
        }
        self.inner.stop().await;
    }
}

/// First frame on a secondary must name the control session it belongs to
async fn park_secondary(
    mut stream: UnifyBufStream, pool: Arc<SecondaryPool>, read_timeout: Duration,
) {
    let codec = MsgpCodec::default();
    match read_frame(&mut stream, &codec, read_timeout, read_timeout).await {
        Ok(frame) if frame.kind == FrameKind::SecondaryAttach => {
            debug!("secondary attached for session {}", frame.session);
            pool.offer(frame.session, stream);
        }
        Ok(frame) => {
            warn!("expected attach on secondary, got {}", frame);
            let _ = stream.close().await;
        }
        Err(e) => {
            debug!("secondary attach read failed: {}", e);
            let _ = stream.close().await;
        }
    }
}

/// Probe parked secondaries so a half-dead one is dropped before a push
/// registration claims it. Healthy streams go straight back into the pool.
fn run_secondary_monitor(
    pool: Arc<SecondaryPool>, period: Duration, read_timeout: Duration,
) -> AbortHandle {
    let (abort, reg) = AbortHandle::new_pair();
    let task = Abortable::new(
        async move {
            let codec = MsgpCodec::default();
            loop {
                sleep(period).await;
                for (session, mut stream) in pool.take_all() {
                    let ping = Frame::ping(0, session, None);
                    let alive = write_frame(&mut stream, &codec, &ping, read_timeout, true)
                        .await
                        .is_ok()
                        && matches!(
                            read_frame(&mut stream, &codec, read_timeout, read_timeout).await,
                            Ok(f) if f.kind == FrameKind::Pong
                        );
                    if alive {
                        pool.offer(session, stream);
                    } else {
                        info!("dropping dead secondary for session {}", session);
                        let _ = stream.close().await;
                    }
                }
            }
        },
        reg,
    )
    .map(|_| ());
    tokio::spawn(task);
    abort
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_claim_times_out_when_empty() {
        rt().block_on(async {
            let pool = SecondaryPool::new();
            assert_eq!(
                pool.claim(1, Duration::from_millis(50)).await.unwrap_err(),
                Fault::Timeout
            );
        });
    }

    #[test]
    fn test_claim_wakes_on_offer() {
        rt().block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let pool = Arc::new(SecondaryPool::new());
            let offerer = pool.clone();
            tokio::spawn(async move {
                let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
                let (accepted, _) = listener.accept().await.unwrap();
                sleep(Duration::from_millis(30)).await;
                offerer.offer(7, UnifyBufStream::new(crate::net::UnifyStream::Tcp(accepted)));
            });
            let stream = pool.claim(7, Duration::from_millis(500)).await;
            assert!(stream.is_ok());
            assert_eq!(pool.available(7), 0);
        });
    }

    #[test]
    fn test_offer_claim_race_never_drops() {
        rt().block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let pool = Arc::new(SecondaryPool::new());

            // offers landing concurrently with a claim must never be lost
            for round in 0..50u64 {
                let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
                let (accepted, _) = listener.accept().await.unwrap();
                let offerer = pool.clone();
                let handle = tokio::spawn(async move {
                    offerer
                        .offer(round, UnifyBufStream::new(crate::net::UnifyStream::Tcp(accepted)));
                });
                let claimed = pool.claim(round, Duration::from_millis(200)).await;
                assert!(claimed.is_ok(), "round {} lost its secondary", round);
                handle.await.unwrap();
            }
        });
    }
}
