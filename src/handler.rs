use crate::callback::CallbackSink;
use crate::config::Metadata;
use crate::error::InvokeError;
use async_trait::async_trait;
use std::fmt;

/// A decoded invocation as the handler sees it. The payload is opaque to the
/// runtime; marshalling belongs to the embedding application.
pub struct InvocationRequest {
    pub subsystem: String,
    pub session: u64,
    pub payload: Vec<u8>,
    pub metadata: Metadata,
}

impl fmt::Display for InvocationRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{} session:{} payload:{}B]",
            self.subsystem,
            self.session,
            self.payload.len()
        )
    }
}

/// Business-logic entry point, registered per subsystem name.
///
/// A failure returned here is wrapped into an error-result response and
/// delivered to the remote caller as `InvokeError::Handler`; it never kills
/// the worker serving the connection.
#[async_trait]
pub trait InvocationHandler: Send + Sync + 'static {
    async fn invoke(&self, req: InvocationRequest) -> Result<Vec<u8>, String>;

    /// Called when a callback registration targets this handler; the sink
    /// is how the handler emits callbacks later.
    fn add_listener(&self, _sink: CallbackSink) {}

    fn remove_listener(&self, _handler_id: u64) {}
}

/// Identifies the failed session in a connection-failure notification
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub session: u64,
    pub peer: String,
}

/// Asynchronous failure channel: lease expiry on the server, dead-server
/// detection by the client's lease pinger. Never invoked for per-call
/// transport errors, which surface synchronously from `invoke()`.
pub trait ConnectionListener: Send + Sync + 'static {
    fn connection_failed(&self, err: &InvokeError, session: &SessionInfo);
}
