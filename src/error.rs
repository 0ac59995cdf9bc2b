use crate::model::CallSite;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Where a failing request came from, attached to backend and validation errors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    pub client_method: Option<String>,
    pub data_path: Vec<String>,
    pub call_site: Option<CallSite>,
}

impl ErrorContext {
    pub fn is_empty(&self) -> bool {
        self.client_method.is_none() && self.data_path.is_empty() && self.call_site.is_none()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(method) = &self.client_method {
            write!(f, " in `{}`", method)?;
        }
        if let Some(site) = &self.call_site {
            write!(f, " at {}", site)?;
        }
        if !self.data_path.is_empty() {
            write!(f, " (path: {})", self.data_path.join("."))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionErrorKind {
    #[error("could not start transaction: {0}")]
    LeaseFailed(String),
    #[error("unable to start a transaction in the given time ({max_wait_ms} ms)")]
    LeaseTimeout { max_wait_ms: u64 },
    #[error("transaction already closed: timeout of {timeout_ms} ms elapsed")]
    Timeout { timeout_ms: u64 },
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("transaction {0} is already closed")]
    Closed(String),
    #[error("nested transactions are not supported")]
    Nested,
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    Engine(String),
}

/// Every failure a caller can observe from a client operation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("Invalid invocation{context}: {message}")]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Backend error {code}{context}: {message}")]
    KnownBackend {
        code: String,
        message: String,
        meta: Option<Value>,
        context: ErrorContext,
    },

    #[error("Unknown backend error{context}: {message}")]
    UnknownBackend {
        message: String,
        context: ErrorContext,
    },

    #[error("Engine initialization failed: {message}")]
    Initialization {
        message: String,
        code: Option<String>,
    },

    #[error("Transaction error: {0}")]
    Transaction(TransactionErrorKind),

    #[error("Interceptor misuse: {message}")]
    InterceptorMisuse { message: String },
}

impl ClientError {
    pub fn validation(message: impl Into<String>) -> Self {
        ClientError::Validation {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        ClientError::UnknownBackend {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ClientError::KnownBackend {
            code: "P2025".to_string(),
            message: message.into(),
            meta: None,
            context: ErrorContext::default(),
        }
    }

    /// Attach call-site context unless the error already carries one
    pub fn with_context(self, new_context: &ErrorContext) -> Self {
        match self {
            ClientError::Validation { message, context } if context.is_empty() => {
                ClientError::Validation {
                    message,
                    context: new_context.clone(),
                }
            }
            ClientError::KnownBackend {
                code,
                message,
                meta,
                context,
            } if context.is_empty() => ClientError::KnownBackend {
                code,
                message,
                meta,
                context: new_context.clone(),
            },
            ClientError::UnknownBackend { message, context } if context.is_empty() => {
                ClientError::UnknownBackend {
                    message,
                    context: new_context.clone(),
                }
            }
            other => other,
        }
    }

    /// The engine failure behind a backend error, as the engine reported it
    pub fn engine_error(&self) -> Option<EngineError> {
        match self {
            ClientError::KnownBackend {
                code,
                message,
                meta,
                ..
            } => Some(EngineError {
                kind: EngineErrorKind::Known,
                code: Some(code.clone()),
                message: message.clone(),
                meta: meta.clone(),
            }),
            ClientError::UnknownBackend { message, .. } => Some(EngineError::unknown(message.clone())),
            _ => None,
        }
    }

    /// Stable backend error code, when there is one
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::KnownBackend { code, .. } => Some(code),
            ClientError::Initialization { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            ClientError::Validation { context, .. }
            | ClientError::KnownBackend { context, .. }
            | ClientError::UnknownBackend { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Structured failure with a stable code
    Known,
    Unknown,
    Initialization,
    Transaction,
}

/// Error reported by the engine collaborator
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub code: Option<String>,
    pub message: String,
    pub meta: Option<Value>,
}

impl EngineError {
    pub fn known(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Known,
            code: Some(code.into()),
            message: message.into(),
            meta: None,
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Unknown,
            code: None,
            message: message.into(),
            meta: None,
        }
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Initialization,
            code: None,
            message: message.into(),
            meta: None,
        }
    }

    pub fn transaction(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Transaction,
            code: Some(code.into()),
            message: message.into(),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

impl From<EngineError> for ClientError {
    fn from(error: EngineError) -> Self {
        match (error.kind, error.code) {
            (EngineErrorKind::Known, Some(code)) => ClientError::KnownBackend {
                code,
                message: error.message,
                meta: error.meta,
                context: ErrorContext::default(),
            },
            (EngineErrorKind::Initialization, code) => ClientError::Initialization {
                message: error.message,
                code,
            },
            (EngineErrorKind::Transaction, _) => {
                ClientError::Transaction(TransactionErrorKind::Engine(error.message))
            }
            _ => ClientError::UnknownBackend {
                message: error.message,
                context: ErrorContext::default(),
            },
        }
    }
}
