// Copyright 2020 Joyent, Inc.

//! Client-side naming: resolve path segments under a root URL to remote
//! references, remembering every answer.
//!
//! All resolvers below one root share the root's cache, keyed by the full
//! URL of the looked-up name. Entries are only ever added.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde_json::Value;
use slog::{debug, o, Drain, Logger};

use crate::container::ContainerRegistry;
use crate::error::Error;
use crate::interface::NAMING_INTERFACE;
use crate::marshal::RemoteRef;
use crate::proxy::Proxy;
use crate::transport::endpoint_of;

type Cache = Arc<Mutex<HashMap<String, NamingEntry>>>;

/// What a name resolves to.
#[derive(Clone)]
pub enum NamingEntry {
    Object(RemoteRef),
    Context(Arc<NamingResolver>),
}

impl NamingEntry {
    pub fn reference(&self) -> Option<&RemoteRef> {
        match self {
            NamingEntry::Object(reference) => Some(reference),
            NamingEntry::Context(_) => None,
        }
    }

    pub fn context(&self) -> Option<&Arc<NamingResolver>> {
        match self {
            NamingEntry::Object(_) => None,
            NamingEntry::Context(resolver) => Some(resolver),
        }
    }
}

impl fmt::Debug for NamingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamingEntry::Object(reference) => write!(f, "Object({:?})", reference),
            NamingEntry::Context(resolver) => write!(f, "Context({})", resolver.url()),
        }
    }
}

pub struct NamingResolver {
    url: String,
    containers: Arc<ContainerRegistry>,
    context: OnceLock<Proxy>,
    cache: Cache,
    log: Logger,
}

impl NamingResolver {
    /// A root resolver for the naming node at `url`.
    pub fn new<U: Into<String>>(
        url: U,
        containers: Arc<ContainerRegistry>,
        log: Option<&Logger>,
    ) -> NamingResolver {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        NamingResolver {
            url: url.into(),
            containers,
            context: OnceLock::new(),
            cache: Arc::new(Mutex::new(HashMap::new())),
            log,
        }
    }

    fn child(&self, url: &str) -> NamingResolver {
        NamingResolver {
            url: String::from(url),
            containers: Arc::clone(&self.containers),
            context: OnceLock::new(),
            cache: Arc::clone(&self.cache),
            log: self.log.clone(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Entries remembered under this resolver's root.
    pub fn cached(&self) -> usize {
        self.lock().len()
    }

    /// Resolve one name. `Ok(None)` means nothing is bound there.
    pub fn lookup(&self, name: &str) -> Result<Option<NamingEntry>, Error> {
        let key = format!("{}/{}", self.url.trim_end_matches('/'), name);
        if let Some(entry) = self.lock().get(&key) {
            return Ok(Some(entry.clone()));
        }

        let value = self
            .context()?
            .invoke("lookup", vec![Value::String(String::from(name))])?;
        let entry = match RemoteRef::from_value(&value) {
            Some(RemoteRef::Context(url)) => {
                NamingEntry::Context(Arc::new(self.child(&url)))
            }
            Some(reference) => NamingEntry::Object(reference),
            None => {
                debug!(self.log, "name not bound"; "context" => &self.url, "name" => name);
                return Ok(None);
            }
        };
        debug!(self.log, "resolved name"; "name" => &key);

        let mut cache = self.lock();
        Ok(Some(cache.entry(key).or_insert(entry).clone()))
    }

    /// Resolve `a/b/c` one segment at a time.
    pub fn lookup_path(&self, path: &str) -> Result<Option<NamingEntry>, Error> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let first = segments
            .next()
            .ok_or_else(|| Error::Naming(format!("empty path under {}", self.url)))?;

        let mut entry = self.lookup(first)?;
        for segment in segments {
            let resolver = match entry {
                Some(NamingEntry::Context(resolver)) => resolver,
                Some(NamingEntry::Object(reference)) => {
                    return Err(Error::Naming(format!(
                        "{} is not a naming context",
                        reference.url()
                    )))
                }
                None => return Ok(None),
            };
            entry = resolver.lookup(segment)?;
        }
        Ok(entry)
    }

    /// Child names, in order.
    pub fn list(&self) -> Result<Vec<String>, Error> {
        match self.context()?.invoke("list", vec![])? {
            Value::Array(names) => names
                .into_iter()
                .map(|name| match name {
                    Value::String(name) => Ok(name),
                    other => Err(Error::Marshal(format!("child name is not a string: {}", other))),
                })
                .collect(),
            _ => Err(Error::Naming(format!(
                "{} is not a naming context",
                self.url
            ))),
        }
    }

    fn context(&self) -> Result<&Proxy, Error> {
        if let Some(proxy) = self.context.get() {
            return Ok(proxy);
        }
        let container = self.containers.get_or_create(endpoint_of(&self.url));
        let interface = container.resolve_remote_interface()?;
        if interface.name() != NAMING_INTERFACE {
            return Err(Error::Naming(format!(
                "{} is not a naming context",
                self.url
            )));
        }
        let proxy = container.create_proxy(&interface, &self.url)?;
        Ok(self.context.get_or_init(|| proxy))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, NamingEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for NamingResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamingResolver")
            .field("url", &self.url)
            .finish()
    }
}
