// Copyright 2020 Joyent, Inc.

//! Conversions between native values and their JSON wire form.
//!
//! References to remote objects travel as single-key objects:
//! `{"$handle": url}`, `{"$home": url}` or `{"$context": url}`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::handle::{Handle, HomeHandle};

const HANDLE_KEY: &str = "$handle";
const HOME_KEY: &str = "$home";
const CONTEXT_KEY: &str = "$context";

pub fn to_value<T: Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(Error::from)
}

pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, Error> {
    serde_json::from_value(value).map_err(Error::from)
}

/// Positional call arguments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Args {
        Args(values)
    }

    /// Arguments from a call frame's data, which must be an array.
    pub fn from_frame(data: &Value) -> Result<Args, Error> {
        match data {
            Value::Array(values) => Ok(Args(values.clone())),
            Value::Null => Ok(Args(Vec::new())),
            other => Err(Error::Marshal(format!(
                "call arguments must be an array, got {}",
                other
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn raw(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    pub fn get<T: DeserializeOwned>(&self, idx: usize) -> Result<T, Error> {
        let value = self.0.get(idx).cloned().ok_or_else(|| {
            Error::Marshal(format!("missing argument {}", idx))
        })?;
        serde_json::from_value(value).map_err(|e| {
            Error::Marshal(format!("argument {}: {}", idx, e))
        })
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Args {
        Args(values)
    }
}

/// An opaque reference found inside a value.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteRef {
    Object(Handle),
    Home(HomeHandle),
    Context(String),
}

impl RemoteRef {
    pub fn url(&self) -> &str {
        match self {
            RemoteRef::Object(handle) => handle.url(),
            RemoteRef::Home(home) => home.url(),
            RemoteRef::Context(url) => url,
        }
    }

    pub fn to_value(&self) -> Value {
        let key = match self {
            RemoteRef::Object(_) => HANDLE_KEY,
            RemoteRef::Home(_) => HOME_KEY,
            RemoteRef::Context(_) => CONTEXT_KEY,
        };
        let mut obj = Map::new();
        obj.insert(String::from(key), Value::String(String::from(self.url())));
        Value::Object(obj)
    }

    /// `None` for anything that is not exactly a reference object.
    pub fn from_value(value: &Value) -> Option<RemoteRef> {
        let obj = value.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let (key, url) = obj.iter().next()?;
        let url = url.as_str()?;
        match key.as_str() {
            HANDLE_KEY => Some(RemoteRef::Object(Handle::new(url))),
            HOME_KEY => Some(RemoteRef::Home(HomeHandle::new(url))),
            CONTEXT_KEY => Some(RemoteRef::Context(String::from(url))),
            _ => None,
        }
    }
}
