//! Messages exchanged between clients and broker
use nanoid::nanoid;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::CallError;

/// Length of generated correlation ids
pub const CORRELATION_ID_LEN: usize = 15;

const CORRELATION_ID_ALPHABET: [char; 26] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

/// Payload of a message. Errors are carried as values and raised when the payload is read.
pub type Payload = std::result::Result<Value, CallError>;

/// Envelope sent over a [crate::Connection]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Message {
    action: Action,
    payload: Payload,
    correlation_id: CorrelationId,
    #[serde(default)]
    flags: Vec<Flag>,
}

/// What the receiver of a [Message] is asked to do
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// Register the function named in payload with the broker
    RegisterFunction,
    /// Remove sender from the broker
    Close,
    /// Reply to the request with the same correlation id
    Return,
    /// Call a function by name
    Call(String),
}

/// Markers attached to a [Message]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    /// Function registration is exempt from the broker's reply timeout
    LongRunning,
}

/// Token binding a reply to the request that caused it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

/// Argument bundle for function calls
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Args {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Message {
    /// Create a new message with a freshly generated correlation id
    pub fn new(action: impl Into<Action>, payload: Payload) -> Self {
        Self::with_id(action, payload, CorrelationId::generate())
    }

    /// Create a new message with given correlation id
    pub fn with_id(action: impl Into<Action>, payload: Payload, id: CorrelationId) -> Self {
        Self {
            action: action.into(),
            payload,
            correlation_id: id,
            flags: vec![],
        }
    }

    /// Attach a flag to message
    pub fn flag(mut self, flag: Flag) -> Self {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
        self
    }

    /// Request for registering a function on broker
    pub fn register_function(name: &str, long_running: bool) -> Self {
        let msg = Self::new(Action::RegisterFunction, Ok(Value::from(name)));
        if long_running {
            msg.flag(Flag::LongRunning)
        } else {
            msg
        }
    }

    /// Request to be removed from broker
    pub fn close() -> Self {
        Self::new(Action::Close, Ok(Value::Null))
    }

    /// Request to call function `name` with given arguments
    pub fn call(name: &str, args: &Args) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            Action::Call(name.to_string()),
            Ok(serde_json::to_value(args)?),
        ))
    }

    /// Reply to given request
    pub fn reply(request: &Message, payload: Payload) -> Self {
        Self::with_id(Action::Return, payload, request.correlation_id.clone())
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn flags(&self) -> &[Flag] {
        &self.flags
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Read the payload, raising the error it carries if any
    pub fn payload(&self) -> Result<&Value, CallError> {
        self.payload.as_ref().map_err(Clone::clone)
    }

    /// Take the payload, raising the error it carries if any
    pub fn into_payload(self) -> Result<Value, CallError> {
        self.payload
    }

    /// Whether this message is the reply to `request`
    pub fn is_reply_to(&self, request: &Message) -> bool {
        self.action == Action::Return && self.correlation_id == request.correlation_id
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            Ok(v) => write!(f, "{}: {} - {}", self.correlation_id, self.action, v),
            Err(e) => write!(f, "{}: {} - {}", self.correlation_id, self.action, e),
        }
    }
}

impl Action {
    pub const REGISTER_FUNCTION: &'static str = "register_function";
    pub const CLOSE: &'static str = "close";
    pub const RETURN: &'static str = "return";

    pub fn as_str(&self) -> &str {
        match self {
            Action::RegisterFunction => Self::REGISTER_FUNCTION,
            Action::Close => Self::CLOSE,
            Action::Return => Self::RETURN,
            Action::Call(name) => name,
        }
    }
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        match value {
            Self::REGISTER_FUNCTION => Action::RegisterFunction,
            Self::CLOSE => Action::Close,
            Self::RETURN => Action::Return,
            name => Action::Call(name.to_string()),
        }
    }
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        Action::from(value.as_str())
    }
}

impl From<Action> for String {
    fn from(value: Action) -> Self {
        match value {
            Action::Call(name) => name,
            action => action.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl CorrelationId {
    /// Generate a new random id. Collisions are statistically unlikely, not impossible.
    pub fn generate() -> Self {
        Self(nanoid!(CORRELATION_ID_LEN, &CORRELATION_ID_ALPHABET))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle of positional arguments
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            args: values.into_iter().map(Into::into).collect(),
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Add a keyword argument
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Decode the positional argument at `index`
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, CallError> {
        let value = self.args.get(index).ok_or_else(|| {
            CallError::InvalidArguments(format!("missing positional argument {index}"))
        })?;
        Ok(T::deserialize(value)?)
    }

    /// Decode the keyword argument `name`, if given
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CallError> {
        self.kwargs
            .get(name)
            .map(|v| T::deserialize(v).map_err(CallError::from))
            .transpose()
    }
}

impl TryFrom<Value> for Args {
    type Error = CallError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(_) => Ok(serde_json::from_value(value)?),
            _ => Err(CallError::InvalidArguments(
                "payload is not an argument bundle".to_string(),
            )),
        }
    }
}
