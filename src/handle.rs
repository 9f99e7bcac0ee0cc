// Copyright 2020 Joyent, Inc.

//! Handles: durable, URL-shaped names for remote objects and their homes.
//!
//! A handle's identity is its URL. The proxy it resolves to is cached for the
//! life of the handle and never travels with it; a handle received from a
//! peer resolves again on first use.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use serde_json::Value;

use crate::container::ContainerRegistry;
use crate::error::Error;
use crate::identity::{IdentityCodec, PrimaryKey};
use crate::marshal::RemoteRef;
use crate::proxy::Proxy;
use crate::transport::endpoint_of;

const ID_PARAM: &str = "id=";

/// Names one remote object: `<endpoint>?id=<objectId>`.
#[derive(Clone)]
pub struct Handle {
    url: String,
    cached: OnceLock<Proxy>,
}

impl Handle {
    pub fn new<U: Into<String>>(url: U) -> Handle {
        Handle {
            url: url.into(),
            cached: OnceLock::new(),
        }
    }

    /// A handle whose proxy is already known.
    pub fn with_proxy<U: Into<String>>(url: U, proxy: Proxy) -> Handle {
        let cached = OnceLock::new();
        let _ = cached.set(proxy);
        Handle {
            url: url.into(),
            cached,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn endpoint(&self) -> &str {
        endpoint_of(&self.url)
    }

    pub fn object_id(&self) -> Option<&str> {
        let idx = self.url.rfind('?')?;
        self.url[idx + 1..].strip_prefix(ID_PARAM)
    }

    pub fn is_resolved(&self) -> bool {
        self.cached.get().is_some()
    }

    pub fn resolve(&self, containers: &ContainerRegistry) -> Result<Proxy, Error> {
        if let Some(proxy) = self.cached.get() {
            return Ok(proxy.clone());
        }
        let proxy = self.materialize(containers).map_err(|e| Error::Resolve {
            url: self.url.clone(),
            source: Box::new(e),
        })?;
        Ok(self.cached.get_or_init(|| proxy).clone())
    }

    fn materialize(&self, containers: &ContainerRegistry) -> Result<Proxy, Error> {
        let container = containers.get_or_create(self.endpoint());
        let interface = container.resolve_remote_interface()?;
        container.create_proxy(&interface, &self.url)
    }
}

/// Names the home (factory) of an endpoint: the endpoint URL itself.
#[derive(Clone)]
pub struct HomeHandle {
    url: String,
    cached: OnceLock<Proxy>,
}

impl HomeHandle {
    pub fn new<U: Into<String>>(url: U) -> HomeHandle {
        HomeHandle {
            url: url.into(),
            cached: OnceLock::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_resolved(&self) -> bool {
        self.cached.get().is_some()
    }

    pub fn resolve(&self, containers: &ContainerRegistry) -> Result<Proxy, Error> {
        if let Some(proxy) = self.cached.get() {
            return Ok(proxy.clone());
        }
        let proxy = self.materialize(containers).map_err(|e| Error::Resolve {
            url: self.url.clone(),
            source: Box::new(e),
        })?;
        Ok(self.cached.get_or_init(|| proxy).clone())
    }

    fn materialize(&self, containers: &ContainerRegistry) -> Result<Proxy, Error> {
        let container = containers.get_or_create(endpoint_of(&self.url));
        let interface = container.resolve_factory_interface()?;
        container.create_proxy(&interface, &self.url)
    }
}

macro_rules! url_identity {
    ($ty:ident, $variant:ident) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &$ty) -> bool {
                self.url == other.url
            }
        }

        impl Eq for $ty {}

        impl Hash for $ty {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.url.hash(state)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    .field("url", &self.url)
                    .field("resolved", &self.is_resolved())
                    .finish()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.url)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                RemoteRef::$variant(self.clone())
                    .to_value()
                    .serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<$ty, D::Error> {
                let value = Value::deserialize(deserializer)?;
                match RemoteRef::from_value(&value) {
                    Some(RemoteRef::$variant(handle)) => Ok(handle),
                    _ => Err(de::Error::custom(format!(
                        "expected a {} reference, got {}",
                        stringify!($ty),
                        value
                    ))),
                }
            }
        }
    };
}

url_identity!(Handle, Object);
url_identity!(HomeHandle, Home);

/// Mints handles for the objects of one endpoint.
#[derive(Debug, Clone)]
pub struct HandleEncoder {
    endpoint: String,
    codec: IdentityCodec,
}

impl HandleEncoder {
    pub fn new<E: Into<String>>(endpoint: E, codec: IdentityCodec) -> HandleEncoder {
        HandleEncoder {
            endpoint: endpoint.into(),
            codec,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Object ids travel in the request preamble line, so line breaks are
    /// refused here.
    pub fn create_handle(&self, key: &PrimaryKey) -> Result<Handle, Error> {
        let object_id = self.codec.encode_key(key)?;
        if object_id.contains(|c| c == '\r' || c == '\n') {
            return Err(Error::decode(object_id, "object ids may not contain line breaks"));
        }
        Ok(self.handle_for_id(&object_id))
    }

    pub fn handle_for_id(&self, object_id: &str) -> Handle {
        Handle::new(format!("{}?{}{}", self.endpoint, ID_PARAM, object_id))
    }

    pub fn home_handle(&self) -> HomeHandle {
        HomeHandle::new(self.endpoint.clone())
    }

    pub fn decode(&self, handle: &Handle) -> Result<PrimaryKey, Error> {
        let id = handle
            .object_id()
            .ok_or_else(|| Error::decode(handle.url(), "handle carries no object id"))?;
        self.codec.decode_key(id)
    }
}
