pub(crate) mod dispatcher;

use crate::error::CallbackError;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Reserved subsystem name for runtime-internal callback operations
pub const CALLBACK_SUBSYSTEM: &'static str = "$callback";

pub const META_OP: &'static str = "op";
pub const META_MODE: &'static str = "mode";
pub const META_HANDLER_ID: &'static str = "handler-id";
pub const META_CALLBACK_ID: &'static str = "callback-id";
pub const META_ACK_REQUIRED: &'static str = "ack-required";
pub const META_MAX_ERRORS: &'static str = "max-errors";
pub const META_PUSH_LOCATOR: &'static str = "push-locator";
pub const META_SUBSYSTEM: &'static str = "subsystem";

pub const OP_REGISTER: &'static str = "register";
pub const OP_UNREGISTER: &'static str = "unregister";
pub const OP_DRAIN: &'static str = "drain";
pub const OP_ACK: &'static str = "ack";

/// How callbacks reach the registered client handler. Selected explicitly
/// at registration, never inferred from which options were supplied.
#[derive(strum::Display, strum::EnumString, PartialEq, Eq, Clone, Copy, Debug)]
pub enum DeliveryMode {
    /// Accumulate server-side; the client drains with `get_callbacks`
    #[strum(serialize = "PULL")]
    Pull,
    /// Client-side background poller drains and dispatches locally
    #[strum(serialize = "POLL")]
    Poll,
    /// Server writes callbacks over a dedicated connection as they occur
    #[strum(serialize = "PUSH")]
    Push,
}

/// Server-originated event. Immutable once created; consumed exactly once
/// per registration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Callback {
    pub payload: Vec<u8>,
    pub server_locator: Option<String>,
    /// Opaque application tag, returned with the callback untouched
    pub handback: Option<String>,
}

impl Callback {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload, server_locator: None, handback: None }
    }

    pub fn with_handback(mut self, handback: &str) -> Self {
        self.handback = Some(handback.to_string());
        self
    }
}

/// A callback with its per-registration delivery id
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CallbackEnvelope {
    pub id: u64,
    pub callback: Callback,
}

/// Registration-time options
#[derive(Clone)]
pub struct CallbackOptions {
    pub mode: DeliveryMode,
    pub ack_required: bool,
    pub max_error_count: Option<usize>,
    pub poll_period: Option<Duration>,
}

impl CallbackOptions {
    pub fn new(mode: DeliveryMode) -> Self {
        Self { mode, ack_required: false, max_error_count: None, poll_period: None }
    }

    pub fn with_ack(mut self) -> Self {
        self.ack_required = true;
        self
    }
}

/// Client-side callback consumer for POLL and PUSH modes. Runs on the
/// poller/push-reader task; the return value is the acknowledgement response
/// when acks are in play.
pub trait ClientCallbackHandler: Send + Sync + 'static {
    fn handle_callback(&self, envelope: CallbackEnvelope) -> Result<Vec<u8>, String>;
}

impl<F> ClientCallbackHandler for F
where
    F: Fn(CallbackEnvelope) -> Result<Vec<u8>, String> + Send + Sync + 'static,
{
    #[inline]
    fn handle_callback(&self, envelope: CallbackEnvelope) -> Result<Vec<u8>, String> {
        (self)(envelope)
    }
}

/// Server-side observer for delivery outcomes of one registration
pub trait CallbackListener: Send + Sync + 'static {
    fn delivery_failed(&self, handler_id: u64, callback_id: u64, err: &CallbackError);

    /// Application-level acknowledgement arrived, with the value the remote
    /// handler returned
    fn acknowledged(&self, _handler_id: u64, _callback_id: u64, _response: &[u8]) {}
}

/// Per-registration delivery state machine, server side.
///
/// Pull/Poll queue into `pending`; Push hands envelopes to the writer task
/// through an unbounded channel so the producing handler never blocks.
pub struct Registration {
    pub handler_id: u64,
    pub session: u64,
    pub mode: DeliveryMode,
    pub ack_required: bool,
    pub max_error_count: usize,
    /// Subsystem the registration targeted, None means all handlers
    pub subsystem: Option<String>,
    closed: AtomicBool,
    next_callback_id: AtomicU64,
    error_count: AtomicU64,
    pending: Mutex<VecDeque<CallbackEnvelope>>,
    push_tx: Mutex<Option<crossfire::Tx<CallbackEnvelope>>>,
    listener: Mutex<Option<Arc<dyn CallbackListener>>>,
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "callback reg {} ({}) session {}", self.handler_id, self.mode, self.session)
    }
}

impl Registration {
    pub fn new(
        handler_id: u64, session: u64, opts: &CallbackOptions, default_max_errors: usize,
        subsystem: Option<String>,
    ) -> Self {
        Self {
            handler_id,
            session,
            mode: opts.mode,
            ack_required: opts.ack_required,
            max_error_count: opts.max_error_count.unwrap_or(default_max_errors),
            subsystem,
            closed: AtomicBool::new(false),
            next_callback_id: AtomicU64::new(1),
            error_count: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            push_tx: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_listener(&self, listener: Arc<dyn CallbackListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    pub(crate) fn set_push_tx(&self, tx: crossfire::Tx<CallbackEnvelope>) {
        *self.push_tx.lock().unwrap() = Some(tx);
    }

    /// Queue or forward one callback; never blocks the producer.
    pub fn deliver(&self, callback: Callback) -> Result<u64, CallbackError> {
        if self.is_closed() {
            return Err(CallbackError::Unregistered(self.handler_id));
        }
        let id = self.next_callback_id.fetch_add(1, Ordering::AcqRel);
        let envelope = CallbackEnvelope { id, callback };
        match self.mode {
            DeliveryMode::Pull | DeliveryMode::Poll => {
                self.pending.lock().unwrap().push_back(envelope);
                Ok(id)
            }
            DeliveryMode::Push => {
                let guard = self.push_tx.lock().unwrap();
                match guard.as_ref() {
                    Some(tx) => match tx.send(envelope) {
                        Ok(_) => Ok(id),
                        Err(_) => Err(CallbackError::Unregistered(self.handler_id)),
                    },
                    // push channel not established yet
                    None => Err(CallbackError::Delivery(format!(
                        "{} has no push channel",
                        self
                    ))),
                }
            }
        }
    }

    /// Hand out everything queued, exactly once, in production order
    pub fn drain(&self) -> Vec<CallbackEnvelope> {
        let mut pending = self.pending.lock().unwrap();
        pending.drain(..).collect()
    }

    /// Record a delivery failure; true means the registration must be torn
    /// down (error budget exhausted or connection-level failure)
    pub fn note_error(&self, callback_id: u64, err: &CallbackError) -> bool {
        let count = self.error_count.fetch_add(1, Ordering::AcqRel) + 1;
        warn!("{}: delivery error #{} for cb {}: {}", self, count, callback_id, err);
        if let Some(l) = self.listener.lock().unwrap().as_ref() {
            l.delivery_failed(self.handler_id, callback_id, err);
        }
        err.is_connection() || count as usize > self.max_error_count
    }

    pub fn note_ack(&self, callback_id: u64, response: &[u8]) {
        if let Some(l) = self.listener.lock().unwrap().as_ref() {
            l.acknowledged(self.handler_id, callback_id, response);
        }
    }

    /// Idempotent; closing drops the push channel which stops the writer
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.push_tx.lock().unwrap().take();
        debug!("{} closed", self);
    }
}

/// All live registrations of one server invoker, with a per-session index
/// so lease expiry can cascade.
pub struct CallbackRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    regs: HashMap<u64, Arc<Registration>>,
    by_session: HashMap<u64, Vec<u64>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner { regs: HashMap::new(), by_session: HashMap::new() }),
        }
    }

    pub fn insert(&self, reg: Arc<Registration>) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_session.entry(reg.session).or_default().push(reg.handler_id);
        inner.regs.insert(reg.handler_id, reg);
    }

    pub fn get(&self, handler_id: u64) -> Option<Arc<Registration>> {
        self.inner.lock().unwrap().regs.get(&handler_id).cloned()
    }

    pub fn remove(&self, handler_id: u64) -> Option<Arc<Registration>> {
        let mut inner = self.inner.lock().unwrap();
        let reg = inner.regs.remove(&handler_id)?;
        if let Some(ids) = inner.by_session.get_mut(&reg.session) {
            ids.retain(|id| *id != handler_id);
        }
        reg.close();
        Some(reg)
    }

    /// Cascade teardown when a session's lease expires or it disconnects
    pub fn teardown_session(&self, session: u64) -> Vec<Arc<Registration>> {
        let ids = {
            let mut inner = self.inner.lock().unwrap();
            inner.by_session.remove(&session).unwrap_or_default()
        };
        let mut closed = Vec::new();
        for id in ids {
            let reg = self.inner.lock().unwrap().regs.remove(&id);
            if let Some(reg) = reg {
                reg.close();
                closed.push(reg);
            }
        }
        closed
    }
}

/// Handed to invocation handlers via `add_listener`; the handler calls
/// `deliver` whenever it wants to notify the registered client.
#[derive(Clone)]
pub struct CallbackSink {
    reg: Arc<Registration>,
}

impl CallbackSink {
    pub(crate) fn new(reg: Arc<Registration>) -> Self {
        Self { reg }
    }

    #[inline]
    pub fn handler_id(&self) -> u64 {
        self.reg.handler_id
    }

    #[inline]
    pub fn deliver(&self, callback: Callback) -> Result<u64, CallbackError> {
        self.reg.deliver(callback)
    }
}
