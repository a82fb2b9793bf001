use super::{
    CallbackEnvelope, CallbackOptions, CallbackRegistry, DeliveryMode, Registration,
    META_ACK_REQUIRED, META_CALLBACK_ID, META_HANDLER_ID, META_MAX_ERRORS, META_MODE, META_OP,
    META_PUSH_LOCATOR, META_SUBSYSTEM, OP_ACK, OP_DRAIN, OP_REGISTER, OP_UNREGISTER,
};
use crate::codec::{Codec, MsgpCodec};
use crate::config::TimeoutSetting;
use crate::error::{CallbackError, Fault, InvokeError};
use crate::locator::Locator;
use crate::net::{UnifyBufStream, UnifyStream};
use crate::proto::{read_frame, write_frame, Frame, FrameKind};
use crate::server::ServerCore;
use async_trait::async_trait;
use crossfire::mpsc;
use crossfire::AsyncRx;
use log::*;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// How the server obtains the dedicated connection PUSH callbacks travel
/// over. The socket transport dials the locator the client advertised; the
/// bisocket transport claims one of the client's pre-attached secondaries.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(
        &self, session: u64, push_locator: Option<&str>,
    ) -> Result<UnifyBufStream, Fault>;

    /// Secondary connections available for `session`, advertised in Pong
    /// frames so the client can replenish. Zero for dialing transports.
    fn available(&self, _session: u64) -> u64 {
        0
    }
}

/// Dial-back connector for the plain socket transport
pub struct DialConnector {
    timeout: TimeoutSetting,
}

impl DialConnector {
    pub fn new(timeout: TimeoutSetting) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PushConnector for DialConnector {
    async fn connect(
        &self, session: u64, push_locator: Option<&str>,
    ) -> Result<UnifyBufStream, Fault> {
        let Some(uri) = push_locator else {
            warn!("push registration for session {} without a push locator", session);
            return Err(Fault::Unreachable);
        };
        let locator = Locator::from_str(uri).map_err(|_| Fault::Unreachable)?;
        let addr = locator.to_addr().map_err(|_| Fault::Unreachable)?;
        let stream = UnifyStream::connect_timeout(&addr, self.timeout.acquire_timeout)
            .await
            .map_err(|e| {
                warn!("push dial to {} failed: {:?}", uri, e);
                Fault::Unreachable
            })?;
        debug!("push channel dialed to {} for session {}", uri, session);
        Ok(UnifyBufStream::new(stream))
    }
}

fn meta_err(what: &str) -> InvokeError {
    InvokeError::Handler(format!("bad callback op: {}", what))
}

/// Runtime-internal operations on the reserved callback subsystem
pub(crate) async fn handle_callback_op(
    core: &Arc<ServerCore>, frame: &Frame,
) -> Result<Vec<u8>, InvokeError> {
    let op = frame.meta.get(META_OP).ok_or_else(|| meta_err("missing op"))?;
    let handler_id: u64 = frame
        .meta
        .get(META_HANDLER_ID)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| meta_err("missing handler id"))?;

    match op.as_str() {
        OP_REGISTER => register(core, frame, handler_id).await,
        OP_UNREGISTER => {
            if let Some(reg) = core.callbacks.remove(handler_id) {
                core.detach_sink(&reg);
                info!("{} unregistered", reg);
            }
            Ok(Vec::new())
        }
        OP_DRAIN => {
            let reg = core
                .callbacks
                .get(handler_id)
                .ok_or(CallbackError::Unregistered(handler_id))
                .map_err(|e| InvokeError::Handler(e.to_string()))?;
            let envelopes = reg.drain();
            if envelopes.is_empty() {
                return Ok(Vec::new());
            }
            trace!("{}: draining {} callbacks", reg, envelopes.len());
            core.codec.encode(&envelopes).map_err(|_| Fault::Encode.into())
        }
        OP_ACK => {
            let callback_id: u64 = frame
                .meta
                .get(META_CALLBACK_ID)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| meta_err("missing callback id"))?;
            if let Some(reg) = core.callbacks.get(handler_id) {
                reg.note_ack(callback_id, &frame.body);
            }
            Ok(Vec::new())
        }
        other => Err(meta_err(other)),
    }
}

async fn register(
    core: &Arc<ServerCore>, frame: &Frame, handler_id: u64,
) -> Result<Vec<u8>, InvokeError> {
    let mode = frame
        .meta
        .get(META_MODE)
        .and_then(|v| DeliveryMode::from_str(v).ok())
        .ok_or_else(|| meta_err("missing mode"))?;
    let ack_required =
        frame.meta.get(META_ACK_REQUIRED).map(|v| v == "true").unwrap_or(false);
    let opts = CallbackOptions {
        mode,
        ack_required,
        max_error_count: frame.meta.get(META_MAX_ERRORS).and_then(|v| v.parse().ok()),
        poll_period: None,
    };
    let subsystem = frame.meta.get(META_SUBSYSTEM).cloned();
    let reg = Arc::new(Registration::new(
        handler_id,
        frame.session,
        &opts,
        core.config.max_error_count,
        subsystem,
    ));

    if mode == DeliveryMode::Push {
        let push_locator = frame.meta.get(META_PUSH_LOCATOR).map(|s| s.as_str());
        let stream = core
            .push_connector()
            .connect(frame.session, push_locator)
            .await
            .map_err(InvokeError::Fault)?;
        let (tx, rx) = mpsc::unbounded_async::<CallbackEnvelope>();
        reg.set_push_tx(tx.into());
        let writer_reg = reg.clone();
        let registry = core.callbacks_shared();
        let timeout = core.config.timeout;
        let ack_timeout = core.config.ack_timeout;
        tokio::spawn(async move {
            run_push_writer(writer_reg, rx, stream, registry, timeout, ack_timeout).await;
        });
    }

    core.callbacks.insert(reg.clone());
    core.attach_sink(&reg);
    info!("{} registered", reg);
    Ok(Vec::new())
}

/// Per-registration PUSH writer: forwards callbacks from the registration's
/// channel over the dedicated connection, enforcing the runtime ack window
/// when acks are required. A fatal delivery verdict tears the registration
/// down, which closes the channel and ends this task.
pub(crate) async fn run_push_writer(
    reg: Arc<Registration>, rx: AsyncRx<CallbackEnvelope>, mut stream: UnifyBufStream,
    registry: Arc<CallbackRegistry>, timeout: TimeoutSetting, ack_timeout: Duration,
) {
    let codec = MsgpCodec::default();
    debug!("push writer for {} started", reg);
    loop {
        let envelope = match rx.recv().await {
            Ok(e) => e,
            // channel closed by unregister or session teardown
            Err(_) => break,
        };
        let callback_id = envelope.id;
        let body = match codec.encode(&envelope.callback) {
            Ok(b) => b,
            Err(_) => {
                if reg.note_error(callback_id, &CallbackError::Delivery("encode failed".into()))
                {
                    registry.remove(reg.handler_id);
                    break;
                }
                continue;
            }
        };
        let frame = Frame::callback_push(
            reg.handler_id,
            reg.session,
            callback_id,
            reg.ack_required,
            body,
        );
        if let Err(e) = write_frame(&mut stream, &codec, &frame, timeout.write_timeout, true).await
        {
            reg.note_error(callback_id, &CallbackError::Connection(e));
            registry.remove(reg.handler_id);
            break;
        }
        if !reg.ack_required {
            continue;
        }
        match await_ack(&mut stream, &codec, callback_id, timeout, ack_timeout).await {
            Ok(response) => {
                reg.note_ack(callback_id, &response);
            }
            Err(err) => {
                if reg.note_error(callback_id, &err) {
                    registry.remove(reg.handler_id);
                    break;
                }
            }
        }
    }
    let _ = stream.close().await;
    debug!("push writer for {} done", reg.handler_id);
}

/// Wait for the runtime ack of `callback_id`, tolerating unrelated control
/// frames (a liveness Pong may interleave on a bisocket secondary).
async fn await_ack(
    stream: &mut UnifyBufStream, codec: &MsgpCodec, callback_id: u64, timeout: TimeoutSetting,
    ack_timeout: Duration,
) -> Result<Vec<u8>, CallbackError> {
    loop {
        let frame = match read_frame(stream, codec, ack_timeout, timeout.read_timeout).await {
            Ok(f) => f,
            Err(Fault::Timeout) => return Err(CallbackError::AckTimeout),
            Err(e) => return Err(CallbackError::Connection(e)),
        };
        match frame.kind {
            FrameKind::CallbackAck if frame.aux == callback_id => return Ok(frame.body),
            FrameKind::CallbackAck => {
                warn!("stale ack for cb {} while waiting on {}", frame.aux, callback_id);
            }
            FrameKind::Pong => {}
            other => {
                return Err(CallbackError::Delivery(format!(
                    "unexpected {} frame while awaiting ack",
                    other
                )));
            }
        }
    }
}
