// Copyright 2020 Joyent, Inc.

//! Per-endpoint client state: interface and key metadata fetched once from
//! the peer, the authorization attribute, and the proxies bound to the
//! endpoint.
//!
//! Metadata is memoized without a lock held across the round trip. Two
//! threads populating the same value at once may both ask the peer; the
//! first stored answer wins and the other is dropped. Nothing is ever
//! refreshed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use serde_json::Value;
use slog::{debug, o, Drain, Logger};

use crate::config::Config;
use crate::error::Error;
use crate::identity::{IdentityCodec, KeyShape};
use crate::interface::{InterfaceCatalog, InterfaceDef};
use crate::protocol::FastMessageId;
use crate::proxy::{self, Proxy};
use crate::registry::Registry;
use crate::transport::{endpoint_of, TcpTransport, Transport};

pub const ATTR_HOME_CLASS: &str = "home-class";
pub const ATTR_FACTORY_CLASS: &str = "factory-class";
pub const ATTR_REMOTE_CLASS: &str = "remote-class";
pub const ATTR_PRIMARY_KEY_CLASS: &str = "primary-key-class";

const GET_ATTRIBUTE: &str = "getAttribute";

/// The explicit scope in which containers are shared: one container per
/// endpoint.
pub struct ContainerRegistry {
    transport: Arc<dyn Transport>,
    catalog: Arc<InterfaceCatalog>,
    containers: Mutex<HashMap<String, Arc<ClientContainer>>>,
    local: Option<Arc<Registry>>,
    default_auth: Option<String>,
    log: Logger,
}

impl ContainerRegistry {
    pub fn new(transport: Arc<dyn Transport>, log: Option<&Logger>) -> ContainerRegistry {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        ContainerRegistry {
            transport,
            catalog: Arc::new(InterfaceCatalog::new()),
            containers: Mutex::new(HashMap::new()),
            local: None,
            default_auth: None,
            log,
        }
    }

    /// TCP transport with the configured timeouts and basic auth token.
    pub fn from_config(config: &Config, log: Option<&Logger>) -> ContainerRegistry {
        let mut registry = ContainerRegistry::new(
            Arc::new(TcpTransport::from_config(config)),
            log,
        );
        registry.default_auth = config.basic_auth.clone();
        registry
    }

    /// Answer metadata queries for endpoints served by `registry` without a
    /// round trip.
    pub fn with_local(mut self, registry: Arc<Registry>) -> ContainerRegistry {
        self.local = Some(registry);
        self
    }

    pub fn catalog(&self) -> &InterfaceCatalog {
        &self.catalog
    }

    pub fn register_interface(&self, def: InterfaceDef) -> Arc<InterfaceDef> {
        self.catalog.register(def)
    }

    pub fn get_or_create(&self, endpoint: &str) -> Arc<ClientContainer> {
        let endpoint = endpoint_of(endpoint);
        if let Some(container) = self.lock().get(endpoint) {
            return Arc::clone(container);
        }

        let fresh = Arc::new(ClientContainer::new(endpoint, self));
        let mut containers = self.lock();
        let container = containers
            .entry(String::from(endpoint))
            .or_insert_with(|| {
                debug!(self.log, "created client container"; "endpoint" => endpoint);
                fresh
            });
        Arc::clone(container)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ClientContainer>>> {
        self.containers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub struct ClientContainer {
    endpoint: String,
    transport: Arc<dyn Transport>,
    catalog: Arc<InterfaceCatalog>,
    local: Option<Arc<Registry>>,
    auth: RwLock<Option<String>>,
    factory: OnceLock<Arc<InterfaceDef>>,
    remote: OnceLock<Arc<InterfaceDef>>,
    key_shape: OnceLock<KeyShape>,
    stubs: Mutex<HashMap<String, Arc<InterfaceDef>>>,
    ids: FastMessageId,
    log: Logger,
}

impl ClientContainer {
    fn new(endpoint: &str, registry: &ContainerRegistry) -> ClientContainer {
        let container = ClientContainer {
            endpoint: String::from(endpoint),
            transport: Arc::clone(&registry.transport),
            catalog: Arc::clone(&registry.catalog),
            local: registry.local.clone(),
            auth: RwLock::new(None),
            factory: OnceLock::new(),
            remote: OnceLock::new(),
            key_shape: OnceLock::new(),
            stubs: Mutex::new(HashMap::new()),
            ids: FastMessageId::new(),
            log: registry.log.new(o!("endpoint" => String::from(endpoint))),
        };
        if let Some(token) = &registry.default_auth {
            container.set_basic_auth(token);
        }
        container
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    /// Applies to every later call through proxies of this container.
    pub fn set_basic_auth(&self, token: &str) {
        if let Ok(mut auth) = self.auth.write() {
            *auth = Some(format!("Basic {}", token));
        }
    }

    pub fn authorization(&self) -> Option<String> {
        self.auth.read().ok().and_then(|auth| auth.clone())
    }

    /// The home interface. Peers name it `factory-class` or `home-class`.
    pub fn resolve_factory_interface(&self) -> Result<Arc<InterfaceDef>, Error> {
        self.memoized_interface(&self.factory, &[ATTR_FACTORY_CLASS, ATTR_HOME_CLASS])
    }

    pub fn resolve_remote_interface(&self) -> Result<Arc<InterfaceDef>, Error> {
        self.memoized_interface(&self.remote, &[ATTR_REMOTE_CLASS])
    }

    pub fn resolve_primary_key_type(&self) -> Result<KeyShape, Error> {
        if let Some(shape) = self.key_shape.get() {
            return Ok(shape.clone());
        }
        let text = self.attribute(ATTR_PRIMARY_KEY_CLASS)?.ok_or_else(|| {
            Error::Config(format!("{} has no primary key", self.endpoint))
        })?;
        let shape: KeyShape = text.parse()?;
        Ok(self.key_shape.get_or_init(|| shape).clone())
    }

    pub fn identity_codec(&self) -> Result<IdentityCodec, Error> {
        self.resolve_primary_key_type().map(IdentityCodec::new)
    }

    /// Reads one metadata attribute, locally when the endpoint is served by
    /// this process.
    pub fn attribute(&self, key: &str) -> Result<Option<String>, Error> {
        if let Some(local) = &self.local {
            if let Some(value) = local.local_attribute(&self.endpoint, key) {
                debug!(self.log, "answered attribute locally"; "key" => key);
                return Ok(value);
            }
        }

        let value = proxy::invoke(
            self,
            &self.endpoint,
            &self.ids,
            GET_ATTRIBUTE,
            vec![Value::String(String::from(key))],
        )?;
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(Error::Marshal(format!(
                "attribute {} is not a string: {}",
                key, other
            ))),
        }
    }

    /// Bind a proxy for `interface` to `url`, which must name this endpoint
    /// or one of its objects.
    pub fn create_proxy(
        self: &Arc<Self>,
        interface: &Arc<InterfaceDef>,
        url: &str,
    ) -> Result<Proxy, Error> {
        if endpoint_of(url) != self.endpoint {
            return Err(Error::Config(format!(
                "{} is not served by {}",
                url, self.endpoint
            )));
        }
        let stub = {
            let mut stubs = self
                .stubs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(
                stubs
                    .entry(interface.name().to_string())
                    .or_insert_with(|| Arc::clone(interface)),
            )
        };

        Ok(Proxy::new(Arc::clone(self), stub, url))
    }

    fn memoized_interface(
        &self,
        cell: &OnceLock<Arc<InterfaceDef>>,
        keys: &[&str],
    ) -> Result<Arc<InterfaceDef>, Error> {
        if let Some(def) = cell.get() {
            return Ok(Arc::clone(def));
        }
        let mut name = None;
        for key in keys {
            name = self.attribute(key)?;
            if name.is_some() {
                break;
            }
        }
        let name = name.ok_or_else(|| {
            Error::Config(format!(
                "{} does not expose {}",
                self.endpoint,
                keys.join(" or ")
            ))
        })?;
        let def = self.catalog.get(&name)?;
        debug!(self.log, "resolved interface"; "attribute" => keys[0], "interface" => &name);

        Ok(Arc::clone(cell.get_or_init(|| def)))
    }
}
