//! Exception taxonomy for workflow programs.
//!
//! Two axes of failure exist at runtime. Workflow exceptions are values a
//! program can raise, catch and inspect; they carry a tag from a closed
//! set plus optional cause and extra fields. Host errors are structural
//! (a missing step, a read-only rebind) and terminate the invocation.
//! [`RuntimeError`] carries both and preserves exception identity through
//! any number of context wrappers.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use super::value::{Value, ValueMap};

/// Closed set of exception tags understood by retry predicates and
/// `try`/`except` handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    AuthError,
    ConnectionError,
    HttpError,
    IndexError,
    KeyError,
    ParallelNestingError,
    RecursionError,
    ResourceLimitError,
    SystemError,
    TimeoutError,
    TypeError,
    UnhandledBranchError,
    ValueError,
    ZeroDivisionError,
}

impl ErrorTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorTag::AuthError => "AuthError",
            ErrorTag::ConnectionError => "ConnectionError",
            ErrorTag::HttpError => "HttpError",
            ErrorTag::IndexError => "IndexError",
            ErrorTag::KeyError => "KeyError",
            ErrorTag::ParallelNestingError => "ParallelNestingError",
            ErrorTag::RecursionError => "RecursionError",
            ErrorTag::ResourceLimitError => "ResourceLimitError",
            ErrorTag::SystemError => "SystemError",
            ErrorTag::TimeoutError => "TimeoutError",
            ErrorTag::TypeError => "TypeError",
            ErrorTag::UnhandledBranchError => "UnhandledBranchError",
            ErrorTag::ValueError => "ValueError",
            ErrorTag::ZeroDivisionError => "ZeroDivisionError",
        }
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured, classifiable failure: tag plus human detail, optional
/// cause chain and optional extra payload fields.
#[derive(Debug, Clone)]
pub struct TaggedError {
    pub tag: ErrorTag,
    pub message: String,
    pub cause: Option<Box<Exception>>,
    pub extra: Option<ValueMap>,
}

impl TaggedError {
    pub fn new(tag: ErrorTag, message: impl Into<String>) -> Self {
        Self {
            tag,
            message: message.into(),
            cause: None,
            extra: None,
        }
    }

    pub fn with_cause(mut self, cause: Exception) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_extra(mut self, extra: ValueMap) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Collects this tag plus the tags of every tagged cause, outermost
    /// first.
    fn tags(&self) -> Vec<Value> {
        let mut tags = vec![Value::String(self.tag.as_str().to_string())];
        let mut cause = self.cause.as_deref();
        while let Some(exception) = cause {
            match exception {
                Exception::Tagged(inner) => {
                    tags.push(Value::String(inner.tag.as_str().to_string()));
                    cause = inner.cause.as_deref();
                }
                _ => break,
            }
        }
        tags
    }
}

impl fmt::Display for TaggedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.tag.as_str())
        } else {
            write!(f, "{}: {}", self.tag, self.message)
        }
    }
}

/// An exception raised by a workflow: a bare string, a user-supplied map,
/// or a tagged error from a built-in.
#[derive(Debug, Clone)]
pub enum Exception {
    String(String),
    Map(ValueMap),
    Tagged(TaggedError),
}

impl Exception {
    pub fn tagged(tag: ErrorTag, message: impl Into<String>) -> Self {
        Exception::Tagged(TaggedError::new(tag, message))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::tagged(ErrorTag::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::tagged(ErrorTag::ValueError, message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::tagged(ErrorTag::KeyError, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::tagged(ErrorTag::IndexError, message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::tagged(ErrorTag::ZeroDivisionError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::tagged(ErrorTag::TimeoutError, message)
    }

    pub fn tag(&self) -> Option<ErrorTag> {
        match self {
            Exception::Tagged(e) => Some(e.tag),
            _ => None,
        }
    }

    /// Structured payload visible to `except` handlers and retry
    /// predicates.
    pub fn payload(&self) -> Value {
        match self {
            Exception::String(s) => Value::String(s.clone()),
            Exception::Map(m) => Value::Map(m.clone()),
            Exception::Tagged(e) => {
                let mut map = BTreeMap::new();
                map.insert("tags".to_string(), Value::from_values(e.tags()));
                if let Some(extra) = &e.extra {
                    for (key, value) in extra.read().iter() {
                        map.insert(key.clone(), value.clone());
                    }
                }
                Value::from_map(map)
            }
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::String(s) => f.write_str(s),
            Exception::Map(_) => match self.payload().to_json() {
                Ok(json) => write!(f, "custom map exception: {json}"),
                Err(_) => f.write_str("custom map exception"),
            },
            Exception::Tagged(e) => {
                write!(f, "{e}")?;
                if let Some(cause) = &e.cause {
                    write!(f, ": {cause}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Exception {}

/// Runtime error: either a catchable workflow [`Exception`] or a host
/// error, optionally wrapped with execution context (step names,
/// operand positions).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Exception(#[from] Exception),

    #[error("{0}")]
    Host(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<RuntimeError>,
    },
}

impl RuntimeError {
    pub fn host(message: impl Into<String>) -> Self {
        RuntimeError::Host(message.into())
    }

    /// Wraps the error with a context prefix, preserving the underlying
    /// exception (if any) for `try`/`except` and retry predicates.
    pub fn context(self, context: impl Into<String>) -> Self {
        RuntimeError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The workflow exception behind any number of context wrappers, or
    /// `None` for host errors.
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            RuntimeError::Exception(e) => Some(e),
            RuntimeError::Host(_) => None,
            RuntimeError::Context { source, .. } => source.exception(),
        }
    }
}
