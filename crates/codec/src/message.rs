use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known fault names carried on the wire.
pub mod faults {
    pub const IO_EXCEPTION: &str = "IOException";
    pub const TYPE_MISMATCH: &str = "TypeMismatch";
    pub const CORRELATION_ERROR: &str = "CorrelationError";
}

/// Identity of a message, unique per emitting process.
///
/// Ids are minted from a monotonic counter; the pairing of a response to
/// its request is done by id equality, never by arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dynamic payload of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Value {
    Void,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Default for Value {
    fn default() -> Self {
        Self::Void
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Void => ValueKind::Void,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Double(_) => ValueKind::Double,
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Type tag used by input-operation declarations.
///
/// `Any` accepts every payload; the other tags accept exactly their own
/// kind.
///
/// # Example
///
/// ```
/// use commux_codec::{Value, ValueKind};
///
/// assert!(ValueKind::Any.accepts(&Value::Int(1)));
/// assert!(ValueKind::String.accepts(&Value::String("hi".to_string())));
/// assert!(!ValueKind::String.accepts(&Value::Int(1)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Void,
    Bool,
    Int,
    Double,
    String,
    Bytes,
    Any,
}

impl Default for ValueKind {
    fn default() -> Self {
        Self::Any
    }
}

impl ValueKind {
    pub fn accepts(&self, value: &Value) -> bool {
        *self == Self::Any || *self == value.kind()
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Double => "double",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Any => "any",
        };

        f.write_str(name)
    }
}

/// An application-level fault reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub name: String,
    pub detail: String,
}

impl Fault {
    pub fn new(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.detail)
    }
}

/// One message on the wire, request or response.
///
/// Messages are immutable after construction; rewriting (redirection id
/// restore, path trimming) builds a new message.
///
/// The resource path's first segment names a redirection target; the
/// remaining segments form the forwarded path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub operation: String,
    pub resource_path: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub fault: Option<Fault>,
}

impl Message {
    pub fn request(
        id: MessageId,
        operation: impl Into<String>,
        resource_path: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            id,
            operation: operation.into(),
            resource_path: resource_path.into(),
            value,
            fault: None,
        }
    }

    pub fn response(id: MessageId, operation: impl Into<String>, value: Value) -> Self {
        Self {
            id,
            operation: operation.into(),
            resource_path: "/".to_string(),
            value,
            fault: None,
        }
    }

    /// Empty acknowledgement for a one-way request, carrying its id.
    pub fn ack(request: &Message) -> Self {
        Self::response(request.id, request.operation.clone(), Value::Void)
    }

    pub fn fault(id: MessageId, operation: impl Into<String>, fault: Fault) -> Self {
        Self {
            id,
            operation: operation.into(),
            resource_path: "/".to_string(),
            value: Value::Void,
            fault: Some(fault),
        }
    }

    /// Rebuild this message under a different id.
    pub fn with_id(&self, id: MessageId) -> Self {
        let mut message = self.clone();
        message.id = id;
        message
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }

    /// Non-empty segments of the resource path.
    ///
    /// # Example
    ///
    /// ```
    /// use commux_codec::{Message, MessageId, Value};
    ///
    /// let message = Message::request(MessageId(1), "ping", "/svcA/deep", Value::Void);
    /// let segments: Vec<&str> = message.path_segments().collect();
    /// assert_eq!(segments, vec!["svcA", "deep"]);
    /// ```
    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.resource_path.split('/').filter(|s| !s.is_empty())
    }
}
