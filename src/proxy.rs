// Copyright 2020 Joyent, Inc.

//! Client stubs.
//!
//! Every call opens its own connection, writes one call frame, waits for the
//! status and the single reply frame, and closes the connection on every
//! path out. Calls made concurrently through the same proxy share nothing
//! but the message id counter.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use slog::{debug, trace};

use crate::client;
use crate::container::ClientContainer;
use crate::error::Error;
use crate::interface::InterfaceDef;
use crate::marshal;
use crate::protocol::FastMessageId;
use crate::transport::{Connection, AUTHORIZATION, STATUS_OK};

/// Implements an interface by forwarding calls to the object named by `url`.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    container: Arc<ClientContainer>,
    interface: Arc<InterfaceDef>,
    url: String,
    ids: FastMessageId,
}

impl Proxy {
    pub(crate) fn new(
        container: Arc<ClientContainer>,
        interface: Arc<InterfaceDef>,
        url: &str,
    ) -> Proxy {
        Proxy {
            inner: Arc::new(ProxyInner {
                container,
                interface,
                url: String::from(url),
                ids: FastMessageId::new(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn interface(&self) -> &InterfaceDef {
        &self.inner.interface
    }

    pub fn container(&self) -> &Arc<ClientContainer> {
        &self.inner.container
    }

    /// Call `method`, which the bound interface must declare with this many
    /// arguments. Returns the value or the single error of the call.
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        self.inner.interface.check_call(method, args.len())?;
        invoke(
            &self.inner.container,
            &self.inner.url,
            &self.inner.ids,
            method,
            args,
        )
    }

    /// `invoke`, then deserialize the value.
    pub fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<R, Error> {
        marshal::from_value(self.invoke(method, args)?)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("url", &self.inner.url)
            .field("interface", &self.inner.interface.name())
            .finish()
    }
}

/// Closes the wrapped connection when dropped.
struct ConnectionGuard(Box<dyn Connection>);

impl Deref for ConnectionGuard {
    type Target = dyn Connection;

    fn deref(&self) -> &(dyn Connection + 'static) {
        self.0.as_ref()
    }
}

impl DerefMut for ConnectionGuard {
    fn deref_mut(&mut self) -> &mut (dyn Connection + 'static) {
        self.0.as_mut()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// One call over a fresh connection, without interface checks.
pub(crate) fn invoke(
    container: &ClientContainer,
    url: &str,
    ids: &FastMessageId,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, Error> {
    let log = container.log();
    let mut conn = ConnectionGuard(container.transport().open(url)?);
    if let Some(auth) = container.authorization() {
        conn.set_attribute(AUTHORIZATION, &auth);
    }

    let msg_id = ids.next();
    let written = client::send(method, args, msg_id, &mut *conn)
        .map_err(|e| Error::transport(url, e))?;
    trace!(log, "sent call"; "method" => method, "id" => msg_id, "bytes" => written);

    let status = conn.status().map_err(|e| Error::transport(url, e))?;
    if status != STATUS_OK {
        let message =
            client::drain_text(conn.body()).map_err(|e| Error::transport(url, e))?;
        debug!(log, "call rejected"; "method" => method, "status" => status);
        return Err(Error::Protocol { status, message });
    }

    let reply =
        client::receive(conn.body(), msg_id).map_err(|e| Error::transport(url, e))?;
    reply.into_reply()
}
