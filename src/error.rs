// Copyright 2020 Joyent, Inc.

//! The single error type surfaced to callers of this crate.

use std::io;

use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::Fault;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed object id or primary key text.
    #[error("unable to decode key '{text}': {reason}")]
    Decode { text: String, reason: String },

    /// Unsupported key field type, undeclared method, unknown interface.
    #[error("configuration error: {0}")]
    Config(String),

    /// A value could not be converted to or from its wire form.
    #[error("marshalling error: {0}")]
    Marshal(String),

    #[error("transport error talking to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: io::Error,
    },

    /// Non-success transport status. The message is the drained body.
    #[error("protocol error (status {status}): {message}")]
    Protocol { status: u16, message: String },

    /// Structured fault decoded from a peer's reply.
    #[error("{0}")]
    Fault(Fault),

    /// Raised by application handlers on the serving side.
    #[error("{0}")]
    Application(String),

    #[error("no such object: {0}")]
    NotFound(String),

    #[error("naming error: {0}")]
    Naming(String),

    #[error("unable to resolve {url}: {source}")]
    Resolve {
        url: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn decode<T: Into<String>, R: Into<String>>(text: T, reason: R) -> Error {
        Error::Decode {
            text: text.into(),
            reason: reason.into(),
        }
    }

    pub fn transport<U: Into<String>>(url: U, source: io::Error) -> Error {
        Error::Transport {
            url: url.into(),
            source,
        }
    }

    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Decode { .. } => "decode",
            Error::Config(_) => "config",
            Error::Marshal(_) => "marshal",
            Error::Transport { .. } => "transport",
            Error::Protocol { .. } => "protocol",
            Error::Fault(_) => "fault",
            Error::Application(_) => "application",
            Error::NotFound(_) => "not-found",
            Error::Naming(_) => "naming",
            Error::Resolve { .. } => "resolve",
        }
    }

    /// The peer-supplied fault code, if this error came back from a peer as
    /// a structured fault. Local failures answer `None`.
    pub fn fault_code(&self) -> Option<&str> {
        match self {
            Error::Fault(fault) => Some(fault.code.as_str()),
            Error::Resolve { source, .. } => source.fault_code(),
            _ => None,
        }
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Error::Fault(fault) => Some(fault),
            Error::Resolve { source, .. } => source.fault(),
            _ => None,
        }
    }

    /// The detail object sent along with a generic service fault.
    pub fn to_detail(&self) -> Value {
        json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }

    /// Every message in the source chain after this one, joined with ": ".
    pub fn cause_chain(&self) -> Option<String> {
        let mut causes = Vec::new();
        let mut current = std::error::Error::source(self);
        while let Some(err) = current {
            causes.push(err.to_string());
            current = err.source();
        }
        if let Error::Fault(fault) = self {
            if let Some(cause) = &fault.cause {
                causes.push(cause.clone());
            }
        }

        if causes.is_empty() {
            None
        } else {
            Some(causes.join(": "))
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Marshal(err.to_string())
    }
}
