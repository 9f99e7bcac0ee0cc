// Copyright 2020 Joyent, Inc.

//! The serving side's table of bound targets, by path.
//!
//! A path that is bound answers with its target's dispatcher. A path that
//! only prefixes bound paths, and the root, is a naming node: it answers
//! `lookup` and `list` for the next path segment.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Error as IoError};
use std::sync::{Arc, RwLock};

use bytes::BytesMut;
use serde_json::Value;
use slog::{debug, info, o, warn, Drain, Logger};

use crate::config::Config;
use crate::container::ATTR_REMOTE_CLASS;
use crate::dispatch::{Call, DispatchTarget, Dispatcher, RemoteTarget, Request, Response};
use crate::error::Error;
use crate::interface::NAMING_INTERFACE;
use crate::marshal::RemoteRef;
use crate::protocol::{self, FastMessage};
use crate::transport::{
    status_reply, write_status, RequestHead, STATUS_BAD_REQUEST, STATUS_NOT_FOUND,
    STATUS_OK, STATUS_SERVER_ERROR,
};

pub struct Registry {
    base_url: String,
    bindings: RwLock<BTreeMap<String, Arc<Dispatcher>>>,
    log: Logger,
}

impl Registry {
    pub fn new<U: Into<String>>(base_url: U, log: Option<&Logger>) -> Registry {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let base_url: String = base_url.into();

        Registry {
            base_url: base_url.trim_end_matches('/').to_string(),
            bindings: RwLock::new(BTreeMap::new()),
            log,
        }
    }

    pub fn from_config(config: &Config, log: Option<&Logger>) -> Registry {
        Registry::new(config.public_url(), log)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, normalize(path))
    }

    /// Bind `target` at `path` and return its URL.
    pub fn bind(&self, path: &str, target: Arc<dyn RemoteTarget>) -> Result<String, Error> {
        let path = normalize(path);
        if path == "/" {
            return Err(Error::Config(String::from(
                "the root path is reserved for naming",
            )));
        }
        let dispatcher = Arc::new(Dispatcher::new(target, Some(&self.log)));
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| Error::Config(String::from("registry lock poisoned")))?;
        if bindings.contains_key(&path) {
            return Err(Error::Config(format!("{} is already bound", path)));
        }
        bindings.insert(path.clone(), dispatcher);
        info!(self.log, "bound target"; "path" => &path);

        Ok(self.url_for(&path))
    }

    pub fn unbind(&self, path: &str) -> bool {
        let path = normalize(path);
        self.bindings
            .write()
            .map(|mut bindings| bindings.remove(&path).is_some())
            .unwrap_or(false)
    }

    pub fn dispatcher(&self, path: &str) -> Option<Arc<Dispatcher>> {
        let path = normalize(path);
        self.bindings
            .read()
            .ok()
            .and_then(|bindings| bindings.get(&path).cloned())
    }

    /// The naming node at `path`, if anything is bound below it.
    pub fn naming_node(&self, path: &str) -> Option<NamingNode> {
        let path = normalize(path);
        let prefix = if path == "/" {
            String::from("/")
        } else {
            format!("{}/", path)
        };
        let bindings = self.bindings.read().ok()?;

        let mut children = BTreeMap::new();
        for (bound, dispatcher) in bindings.iter() {
            let rest = match bound.strip_prefix(&prefix) {
                Some(rest) => rest,
                None => continue,
            };
            let (child, deeper) = match rest.split_once('/') {
                Some((child, _)) => (child, true),
                None => (rest, false),
            };
            let child_url = format!("{}{}{}", self.base_url, prefix, child);
            let reference = match (deeper, dispatcher.target()) {
                (false, DispatchTarget::Object(target)) => target.reference(&child_url),
                _ => RemoteRef::Context(child_url),
            };
            // A bound child wins over a context of the same name.
            match children.get(child) {
                Some(RemoteRef::Context(_)) | None => {
                    children.insert(String::from(child), reference);
                }
                Some(_) => (),
            }
        }

        if children.is_empty() && path != "/" {
            return None;
        }
        Some(NamingNode {
            url: format!("{}{}", self.base_url, path),
            children,
        })
    }

    /// Metadata for an endpoint served here, or `None` when `endpoint_url`
    /// is not under this registry.
    pub fn local_attribute(&self, endpoint_url: &str, key: &str) -> Option<Option<String>> {
        let path = endpoint_url.strip_prefix(&self.base_url)?;
        if !path.is_empty() && !path.starts_with('/') {
            return None;
        }
        if let Some(dispatcher) = self.dispatcher(path) {
            return Some(dispatcher.attribute(key));
        }
        self.naming_node(path).map(|node| node.attribute(key))
    }

    /// Read a request (preamble and call frame) and produce the complete
    /// response bytes.
    pub fn handle_request<R: BufRead>(&self, reader: &mut R) -> BytesMut {
        let head = match RequestHead::read_from(reader) {
            Ok(head) => head,
            Err(e) => {
                warn!(self.log, "unreadable request preamble"; "err" => %e);
                return status_reply(STATUS_BAD_REQUEST, &e.to_string());
            }
        };
        let frame = read_frame(reader);
        self.respond(&head, frame)
    }

    pub fn respond(&self, head: &RequestHead, frame: io::Result<FastMessage>) -> BytesMut {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                warn!(self.log, "unreadable call frame"; "err" => %e);
                return status_reply(
                    STATUS_BAD_REQUEST,
                    &format!("unable to read call frame: {}", e),
                );
            }
        };

        let path = normalize(head.path());
        let dispatcher = match self.dispatcher(&path) {
            Some(dispatcher) => dispatcher,
            None => match self.naming_node(&path) {
                Some(node) => Arc::new(Dispatcher::naming(node, Some(&self.log))),
                None => {
                    debug!(self.log, "nothing bound"; "path" => &path);
                    return status_reply(
                        STATUS_NOT_FOUND,
                        &format!("nothing is bound at {}", path),
                    );
                }
            },
        };

        let msg_id = message.id;
        let request = Request::new(head.clone(), message, self.url_for(&path));
        let mut response = Response::new();
        match dispatcher.service(&request, &mut response) {
            Ok(()) => {
                let mut out = BytesMut::new();
                write_status(&mut out, STATUS_OK);
                out.extend_from_slice(&response.into_bytes());
                if let Err(e) = protocol::encode_msg(&FastMessage::end(msg_id), &mut out) {
                    warn!(self.log, "unable to encode end frame"; "err" => %e);
                }
                out
            }
            Err(Error::Protocol { status, message }) => {
                let status = if status == STATUS_OK {
                    STATUS_SERVER_ERROR
                } else {
                    status
                };
                status_reply(status, &message)
            }
            Err(e) => status_reply(STATUS_SERVER_ERROR, &e.to_string()),
        }
    }
}

fn read_frame<R: BufRead>(reader: &mut R) -> io::Result<FastMessage> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    FastMessage::parse(&buf).map_err(IoError::from)
}

/// `/a/b` form: one leading slash, no trailing or doubled slashes.
pub fn normalize(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// A snapshot of one naming context: child names and how each is referred
/// to.
#[derive(Debug, Clone, PartialEq)]
pub struct NamingNode {
    url: String,
    children: BTreeMap<String, RemoteRef>,
}

impl NamingNode {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn lookup(&self, name: &str) -> Value {
        self.children
            .get(name)
            .map(RemoteRef::to_value)
            .unwrap_or(Value::Null)
    }

    pub fn list(&self) -> Value {
        Value::Array(
            self.children
                .keys()
                .map(|name| Value::String(name.clone()))
                .collect(),
        )
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        match key {
            ATTR_REMOTE_CLASS => Some(String::from(NAMING_INTERFACE)),
            _ => None,
        }
    }

    pub fn invoke(&self, call: &Call<'_>) -> Option<Result<Value, Error>> {
        match call.method {
            "lookup" => Some(call.arg::<String>(0).map(|name| self.lookup(&name))),
            "list" => Some(Ok(self.list())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    use crate::dispatch::{Exported, Skeleton};
    use crate::interface::InterfaceDef;

    struct Nothing;

    fn target(name: &str) -> Arc<dyn RemoteTarget> {
        let skeleton = Skeleton::<Nothing>::builder(InterfaceDef::new(name))
            .build()
            .unwrap();
        Arc::new(Exported::new(skeleton, Arc::new(Nothing)))
    }

    fn registry() -> Registry {
        let registry = Registry::new("fast://h:2030/", None);
        registry.bind("/calc", target("calculator")).unwrap();
        registry.bind("ejb/counter", target("counter")).unwrap();
        registry.bind("/ejb/deep/thing/", target("thing")).unwrap();
        registry
    }

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("//a//b/"), "/a/b");
        assert_eq!(registry().url_for("ejb/counter"), "fast://h:2030/ejb/counter");
    }

    #[test]
    fn double_binding_is_rejected() {
        let registry = registry();

        assert!(matches!(
            registry.bind("/calc/", target("calculator")),
            Err(Error::Config(_))
        ));
        assert!(matches!(registry.bind("/", target("x")), Err(Error::Config(_))));
        assert!(registry.unbind("calc"));
        assert!(registry.bind("/calc", target("calculator")).is_ok());
    }

    #[test]
    fn naming_nodes_describe_children() {
        let registry = registry();
        let root = registry.naming_node("/").unwrap();

        assert_eq!(root.list(), json!(["calc", "ejb"]));
        assert_eq!(root.lookup("calc"), json!({"$handle": "fast://h:2030/calc"}));
        assert_eq!(root.lookup("ejb"), json!({"$context": "fast://h:2030/ejb"}));
        assert_eq!(root.lookup("missing"), Value::Null);

        let ejb = registry.naming_node("/ejb").unwrap();
        assert_eq!(ejb.list(), json!(["counter", "deep"]));
        assert_eq!(ejb.lookup("deep"), json!({"$context": "fast://h:2030/ejb/deep"}));

        assert!(registry.naming_node("/calc").is_none());
        assert!(registry.naming_node("/nowhere").is_none());
    }

    #[test]
    fn local_attributes() {
        let registry = registry();

        assert_eq!(
            registry.local_attribute("fast://h:2030/calc", "remote-class"),
            Some(Some(String::from("calculator")))
        );
        assert_eq!(
            registry.local_attribute("fast://h:2030/ejb", "remote-class"),
            Some(Some(String::from(NAMING_INTERFACE)))
        );
        assert_eq!(registry.local_attribute("fast://other:2030/calc", "remote-class"), None);
        assert_eq!(registry.local_attribute("fast://h:20301/calc", "remote-class"), None);
    }

    #[test]
    fn unbound_path_is_not_found() {
        let registry = registry();
        let mut buf = BytesMut::new();
        RequestHead::new("/nowhere").encode(&mut buf);
        protocol::encode_msg(&FastMessage::call(1, "ping", vec![]), &mut buf).unwrap();

        let out = registry.handle_request(&mut &buf[..]);
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("FAST/1 404 "));
        assert!(text.ends_with("nothing is bound at /nowhere"));
    }

    #[test]
    fn garbage_is_a_bad_request() {
        let out = registry().handle_request(&mut &b"HELLO\r\n\r\n"[..]);

        assert!(String::from_utf8_lossy(&out).starts_with("FAST/1 400 "));
    }
}
