use std::backtrace::Backtrace;
use std::fmt;

/// Terminal failure of a coroutine caused by a panic or by misuse of a
/// workflow primitive.
///
/// Misuse (negative `WaitGroup` counter, settling a future twice, sending on a
/// closed channel, ...) is reported through this type as a regular error value
/// instead of unwinding, so the message and the captured stack travel through
/// the normal `Result` channel up to the coroutine boundary.
///
/// # Example
///
/// ```rust
/// use durable_coroutines::PanicError;
///
/// let err = PanicError::new("negative WaitGroup counter", "stack");
/// assert_eq!(err.to_string(), "negative WaitGroup counter");
/// assert_eq!(err.stack_trace(), "stack");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicError {
    message: String,
    stack_trace: String,
}

impl PanicError {
    /// Create a panic error from an explicit message and stack trace.
    pub fn new(message: impl Into<String>, stack_trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: stack_trace.into(),
        }
    }

    /// Create a panic error carrying the caller's current stack.
    pub(crate) fn capture(message: impl Into<String>) -> Self {
        Self::new(message, Backtrace::force_capture().to_string())
    }

    /// The panic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The stack captured where the panic or misuse happened.
    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PanicError {}

/// Error surfaced to workflow code and to the host.
///
/// # Classification
///
/// - `Canceled`: the blocking call was interrupted by a canceled scope.
///   Expected and recoverable.
/// - `Panic`: a panic inside workflow code or misuse of a primitive. Fatal to
///   the coroutine that raised it; fatal to the execution only for the root.
/// - `Application`: an error returned by workflow code or by external work
///   (a failed activity).
/// - `Decode`: an external result that could not be decoded into the type the
///   workflow asked for.
///
/// Corrupted channel payloads are deliberately absent: they are counted and
/// dropped, never surfaced as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    Canceled,
    Panic(PanicError),
    Application { message: String },
    Decode { message: String },
}

impl WorkflowError {
    /// Create an application error.
    pub fn application(message: impl Into<String>) -> Self {
        WorkflowError::Application {
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        WorkflowError::Decode {
            message: message.into(),
        }
    }

    /// Misuse of a primitive: a panic error carrying the current stack.
    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        WorkflowError::Panic(PanicError::capture(message))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, WorkflowError::Canceled)
    }

    /// The panic details when this error is a panic or misuse.
    pub fn as_panic(&self) -> Option<&PanicError> {
        match self {
            WorkflowError::Panic(p) => Some(p),
            _ => None,
        }
    }

    /// Short category label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::Canceled => "canceled",
            WorkflowError::Panic(_) => "panic",
            WorkflowError::Application { .. } => "app_error",
            WorkflowError::Decode { .. } => "decode_error",
        }
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::Canceled => f.write_str("canceled"),
            WorkflowError::Panic(p) => write!(f, "{p}"),
            WorkflowError::Application { message } => f.write_str(message),
            WorkflowError::Decode { message } => write!(f, "decode error: {message}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<PanicError> for WorkflowError {
    fn from(p: PanicError) -> Self {
        WorkflowError::Panic(p)
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        WorkflowError::decode(e.to_string())
    }
}

/// Conversion from String so workflow code can `?` plain string errors.
impl From<String> for WorkflowError {
    fn from(s: String) -> Self {
        WorkflowError::application(s)
    }
}

impl From<&str> for WorkflowError {
    fn from(s: &str) -> Self {
        WorkflowError::application(s)
    }
}
