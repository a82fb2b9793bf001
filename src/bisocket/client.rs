use crate::callback::{CallbackOptions, ClientCallbackHandler};
use crate::client::{run_push_reader, ClientInvoker};
use crate::codec::MsgpCodec;
use crate::config::{ClientConfig, Metadata, ParamKey, Resolver};
use crate::error::InvokeError;
use crate::handler::ConnectionListener;
use crate::locator::Locator;
use crate::net::{UnifyAddr, UnifyBufStream, UnifyStream};
use crate::proto::{write_frame, Frame};
use futures::future::{AbortHandle, Abortable};
use futures::FutureExt;
use log::*;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::sleep;

/// Client invoker for the bisocket transport.
///
/// Wraps a [ClientInvoker] for the control connection and additionally
/// dials the advertised secondary ports, attaching each connection to the
/// control session so the server can park it for later PUSH use. A control
/// monitor keeps the server-side pool above the low-water mark using the
/// availability count piggybacked on Pong frames.
pub struct BisocketClientInvoker {
    inner: Arc<ClientInvoker>,
    targets: Vec<(String, u16)>,
    secondary_count: usize,
    pool_low_water: usize,
    ping_frequency: Duration,
    next_target: AtomicUsize,
    readers: Mutex<Vec<AbortHandle>>,
    monitor: Mutex<Option<AbortHandle>>,
}

impl BisocketClientInvoker {
    pub fn new(locator: Locator, config: ClientConfig) -> Result<Arc<Self>, InvokeError> {
        let targets = locator.secondary_hosts()?;
        if targets.is_empty() {
            return Err(InvokeError::config(
                "bisocket client locator needs secondary-connect-ports",
            ));
        }
        let resolver =
            Resolver::new(Some(&locator.params), Some(&config.params), None, config.policy);
        let secondary_count =
            resolver.get_usize(ParamKey::SecondaryCount)?.unwrap_or(targets.len());
        let pool_low_water = resolver.get_usize(ParamKey::PoolLowWater)?.unwrap_or(1);
        let ping_frequency =
            resolver.get_millis(ParamKey::PingFrequency)?.unwrap_or(Duration::ZERO);
        let inner = ClientInvoker::new(locator, config)?;
        Ok(Arc::new(Self {
            inner,
            targets,
            secondary_count,
            pool_low_water,
            ping_frequency,
            next_target: AtomicUsize::new(0),
            readers: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
        }))
    }

    #[inline]
    pub fn invoker(&self) -> &Arc<ClientInvoker> {
        &self.inner
    }

    #[inline]
    pub fn session(&self) -> u64 {
        self.inner.session()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.add_connection_listener(listener);
    }

    /// Connect the control channel, then attach the configured number of
    /// secondaries and start the replenishing monitor (when enabled).
    pub async fn connect(self: &Arc<Self>) -> Result<(), InvokeError> {
        self.inner.connect().await?;
        for _ in 0..self.secondary_count {
            self.attach_secondary().await?;
        }
        if self.ping_frequency > Duration::ZERO {
            let abort = run_control_monitor(
                Arc::downgrade(self),
                self.ping_frequency,
                self.pool_low_water,
            );
            *self.monitor.lock().unwrap() = Some(abort);
        }
        Ok(())
    }

    pub async fn invoke(
        &self, subsystem: &str, payload: Vec<u8>, metadata: Metadata,
    ) -> Result<Vec<u8>, InvokeError> {
        self.inner.invoke(subsystem, payload, metadata).await
    }

    pub async fn register_callbacks(
        &self, subsystem: Option<&str>, opts: CallbackOptions,
        handler: Arc<dyn ClientCallbackHandler>,
    ) -> Result<u64, InvokeError> {
        self.inner.register_callbacks(subsystem, opts, handler).await
    }

    pub async fn unregister_callbacks(&self, handler_id: u64) -> Result<(), InvokeError> {
        self.inner.unregister_callbacks(handler_id).await
    }

    pub async fn disconnect(&self) {
        if let Some(m) = self.monitor.lock().unwrap().take() {
            m.abort();
        }
        let readers: Vec<AbortHandle> = self.readers.lock().unwrap().drain(..).collect();
        for r in readers {
            r.abort();
        }
        self.inner.disconnect().await;
    }

    /// Dial the next advertised secondary port round-robin, bind the
    /// connection to our session and hand it to a push reader.
    async fn attach_secondary(&self) -> Result<(), InvokeError> {
        let idx = self.next_target.fetch_add(1, Ordering::AcqRel) % self.targets.len();
        let (host, port) = &self.targets[idx];
        let addr = UnifyAddr::from_str(&format!("{}:{}", host, port))
            .map_err(|_| InvokeError::config(format!("bad secondary target {}:{}", host, port)))?;
        let timeout = self.inner.effective_timeout();
        let stream = UnifyStream::connect_timeout(&addr, timeout.acquire_timeout)
            .await
            .map_err(InvokeError::from)?;
        let mut buf = UnifyBufStream::new(stream);
        let codec = MsgpCodec::default();
        let attach = Frame::secondary_attach(self.inner.session());
        write_frame(&mut buf, &codec, &attach, timeout.write_timeout, true)
            .await
            .map_err(InvokeError::Fault)?;
        debug!("secondary attached to {} for session {}", addr, self.inner.session());

        let handlers = self.inner.callback_handlers();
        let (abort, reg) = AbortHandle::new_pair();
        let task =
            Abortable::new(run_push_reader(buf, handlers, timeout), reg).map(|_| ());
        tokio::spawn(task);
        self.readers.lock().unwrap().push(abort);
        Ok(())
    }
}

/// Ping the control channel at the configured frequency; the Pong carries
/// how many unclaimed secondaries the server still holds, and a deficit
/// against the low-water mark gets topped up immediately.
fn run_control_monitor(
    invoker: Weak<BisocketClientInvoker>, period: Duration, low_water: usize,
) -> AbortHandle {
    let (abort, reg) = AbortHandle::new_pair();
    let task = Abortable::new(
        async move {
            loop {
                sleep(period).await;
                let Some(invoker) = invoker.upgrade() else {
                    return;
                };
                match invoker.inner.ping().await {
                    Ok(available) => {
                        let available = available as usize;
                        if available < low_water {
                            debug!(
                                "secondary pool at {}, low water {}, replenishing",
                                available, low_water
                            );
                            for _ in available..low_water {
                                if let Err(e) = invoker.attach_secondary().await {
                                    warn!("secondary replenish failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("control ping failed: {}", e);
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
