use std::fmt;
use std::str::FromStr;

/// "inv_" prefix is reserved for runtime-level faults on the wire
pub const FAULT_PREFIX: &'static str = "inv_";

/// Transport/runtime-level fault, string-serialized on the wire so that the
/// peer can recover the typed variant with [FromStr].
///
/// NOTE a caller seeing `Fault` never sees a handler failure: handler
/// failures travel as [InvokeError::Handler].
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    PartialOrd,
    Clone,
    Copy,
    thiserror::Error,
)]
#[repr(u8)]
pub enum Fault {
    /// Connect or ping failed, peer never reached
    #[strum(serialize = "inv_unreachable")]
    Unreachable = 0,
    /// Socket read/write error mid-exchange
    #[strum(serialize = "inv_io_err")]
    Io = 1,
    /// Socket operation, pool acquire or secondary claim timed out
    #[strum(serialize = "inv_timeout")]
    Timeout = 2,
    /// Invoker used while disconnected, or stream closed by peer
    #[strum(serialize = "inv_closed")]
    Closed = 3,
    /// No invocation handler registered for the subsystem
    #[strum(serialize = "inv_subsystem_notfound")]
    Subsystem = 4,
    /// Runtime structure failed to encode
    #[strum(serialize = "inv_encode")]
    Encode = 5,
    /// Runtime structure failed to decode
    #[strum(serialize = "inv_decode")]
    Decode = 6,
    /// Wrong magic or unsupported protocol version byte
    #[strum(serialize = "inv_version")]
    Version = 7,
    /// Worker evicted from the LRU pool
    #[strum(serialize = "inv_evicted")]
    Evicted = 8,
    #[strum(serialize = "inv_internal")]
    Internal = 9,
}

// The Debug derive would ignore the strum serials
impl fmt::Debug for Fault {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Fault {
    #[inline]
    pub fn as_bytes<'a>(&'a self) -> &'a [u8] {
        self.as_ref().as_bytes()
    }
}

impl From<std::io::Error> for Fault {
    #[inline(always)]
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut { Self::Timeout } else { Self::Io }
    }
}

/// The error a caller of `invoke()` can observe.
///
/// The taxonomy keeps transport failure and application failure apart:
/// a handler that returns an error produces `Handler`, never `Fault`.
#[derive(thiserror::Error, Clone, PartialEq)]
pub enum InvokeError {
    /// Transport/runtime fault, local to one invocation
    #[error("{0}")]
    Fault(Fault),
    /// The invocation handler itself failed; carried as a normal response
    /// payload, the connection stays usable
    #[error("handler: {0}")]
    Handler(String),
    /// Malformed locator, mismatched port lists, bad parameter value.
    /// Raised at setup time, never deferred.
    #[error("config: {0}")]
    Config(String),
}

impl fmt::Debug for InvokeError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<Fault> for InvokeError {
    #[inline(always)]
    fn from(e: Fault) -> Self {
        Self::Fault(e)
    }
}

impl From<std::io::Error> for InvokeError {
    #[inline(always)]
    fn from(e: std::io::Error) -> Self {
        Self::Fault(e.into())
    }
}

impl InvokeError {
    /// Parse an error body from a response frame.
    ///
    /// The server writes faults as their strum serial, handler errors as
    /// plain text; "inv_" is reserved so the two cannot collide.
    pub fn from_wire(body: &[u8]) -> Self {
        match std::str::from_utf8(body) {
            Ok(s) => {
                if s.starts_with(FAULT_PREFIX) {
                    if let Ok(fault) = Fault::from_str(s) {
                        return Self::Fault(fault);
                    }
                }
                Self::Handler(s.to_string())
            }
            Err(_) => Self::Handler(format!("err blob {} length", body.len())),
        }
    }

    #[inline]
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    #[inline]
    pub fn is_fault(&self, f: Fault) -> bool {
        matches!(self, Self::Fault(o) if *o == f)
    }
}

/// Callback-delivery specific failure, reported to the originating side's
/// listener; only `Connection` tears the channel down.
#[derive(thiserror::Error, Clone, PartialEq)]
pub enum CallbackError {
    #[error("callback connection: {0}")]
    Connection(Fault),
    /// Peer did not acknowledge within the configured window
    #[error("callback ack timeout")]
    AckTimeout,
    /// Registration gone (unregistered or lease expired)
    #[error("callback registration {0} not found")]
    Unregistered(u64),
    #[error("callback delivery: {0}")]
    Delivery(String),
}

impl fmt::Debug for CallbackError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<Fault> for CallbackError {
    #[inline(always)]
    fn from(e: Fault) -> Self {
        Self::Connection(e)
    }
}

impl CallbackError {
    #[inline]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
