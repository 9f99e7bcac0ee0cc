// Copyright 2020 Joyent, Inc.

//! Server skeletons.
//!
//! A [`Skeleton`] is the dispatch table for one interface: method name to
//! handler, built once when the target is registered. A [`Dispatcher`] wraps
//! a target (or a naming node), decodes the call, runs the handler and
//! writes exactly one reply frame, a value or a fault, for every request it
//! services. The only error it hands back to the transport is a protocol
//! error raised by a handler.

use std::collections::HashMap;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;
use slog::{debug, o, warn, Drain, Logger};

use crate::container::{
    ATTR_FACTORY_CLASS, ATTR_HOME_CLASS, ATTR_PRIMARY_KEY_CLASS, ATTR_REMOTE_CLASS,
};
use crate::error::Error;
use crate::handle::{Handle, HandleEncoder, HomeHandle};
use crate::identity::{IdentityCodec, PrimaryKey};
use crate::interface::InterfaceDef;
use crate::marshal::{self, Args, RemoteRef};
use crate::protocol::{self, FastMessage, Fault};
use crate::registry::NamingNode;
use crate::transport::{RequestHead, AUTHORIZATION};

/// What a handler sees of the call it is serving.
#[derive(Clone, Copy)]
pub struct Call<'a> {
    pub method: &'a str,
    pub args: &'a Args,
    pub object_id: Option<&'a str>,
    /// URL of the endpoint the call arrived at.
    pub endpoint: &'a str,
    pub authorization: Option<&'a str>,
    codec: Option<&'a IdentityCodec>,
}

impl<'a> Call<'a> {
    pub fn new(method: &'a str, args: &'a Args, endpoint: &'a str) -> Call<'a> {
        Call {
            method,
            args,
            object_id: None,
            endpoint,
            authorization: None,
            codec: None,
        }
    }

    pub fn arg<T: serde::de::DeserializeOwned>(&self, idx: usize) -> Result<T, Error> {
        self.args.get(idx)
    }

    /// The primary key of the target object, decoded with the endpoint's
    /// codec.
    pub fn key(&self) -> Result<PrimaryKey, Error> {
        let id = self
            .object_id
            .ok_or_else(|| Error::Config(String::from("call has no object id")))?;
        self.codec()?.decode_key(id)
    }

    /// A handle to another object of this endpoint.
    pub fn handle_for(&self, key: &PrimaryKey) -> Result<Handle, Error> {
        HandleEncoder::new(self.endpoint, self.codec()?.clone()).create_handle(key)
    }

    fn codec(&self) -> Result<&'a IdentityCodec, Error> {
        self.codec.ok_or_else(|| {
            Error::Config(format!("{} has no primary key", self.endpoint))
        })
    }
}

pub type Handler<T> =
    Box<dyn Fn(&T, &Call<'_>) -> Result<Value, Error> + Send + Sync>;

/// The dispatch table for one interface.
pub struct Skeleton<T> {
    interface: Arc<InterfaceDef>,
    methods: HashMap<String, Handler<T>>,
}

impl<T> Skeleton<T> {
    pub fn builder(interface: InterfaceDef) -> SkeletonBuilder<T> {
        SkeletonBuilder {
            interface,
            methods: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn interface(&self) -> &InterfaceDef {
        &self.interface
    }

    pub fn handles(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// `None` when the interface has no such method.
    pub fn invoke(&self, target: &T, call: &Call<'_>) -> Option<Result<Value, Error>> {
        let handler = self.methods.get(call.method)?;
        if let Err(e) = self.interface.check_call(call.method, call.args.len()) {
            return Some(Err(Error::Marshal(e.to_string())));
        }
        Some(handler(target, call))
    }
}

pub struct SkeletonBuilder<T> {
    interface: InterfaceDef,
    methods: HashMap<String, Handler<T>>,
    errors: Vec<String>,
}

impl<T> SkeletonBuilder<T> {
    pub fn method<F, R>(mut self, name: &str, handler: F) -> SkeletonBuilder<T>
    where
        F: Fn(&T, &Call<'_>) -> Result<R, Error> + Send + Sync + 'static,
        R: Serialize,
    {
        if self.interface.arity(name).is_none() {
            self.errors.push(format!(
                "{} declares no method '{}'",
                self.interface.name(),
                name
            ));
            return self;
        }
        self.methods.insert(
            String::from(name),
            Box::new(move |target: &T, call: &Call<'_>| {
                handler(target, call).and_then(|r| marshal::to_value(&r))
            }),
        );
        self
    }

    /// Fails unless every declared method has exactly one handler.
    pub fn build(mut self) -> Result<Skeleton<T>, Error> {
        for method in self.interface.methods() {
            if !self.methods.contains_key(method) {
                self.errors.push(format!(
                    "{}.{} has no handler",
                    self.interface.name(),
                    method
                ));
            }
        }
        if !self.errors.is_empty() {
            return Err(Error::Config(self.errors.join("; ")));
        }
        Ok(Skeleton {
            interface: Arc::new(self.interface),
            methods: self.methods,
        })
    }
}

/// A served object, with its skeleton(s) and metadata erased behind one
/// interface.
pub trait RemoteTarget: Send + Sync {
    /// Metadata answered to `getAttribute`.
    fn attribute(&self, key: &str) -> Option<String>;

    /// How a naming lookup refers to this target when bound at `url`.
    fn reference(&self, url: &str) -> RemoteRef;

    /// `None` when no handler matches the call.
    fn invoke(&self, call: &Call<'_>) -> Option<Result<Value, Error>>;
}

/// A single object bound at a path.
pub struct Exported<T> {
    skeleton: Skeleton<T>,
    target: Arc<T>,
}

impl<T> Exported<T> {
    pub fn new(skeleton: Skeleton<T>, target: Arc<T>) -> Exported<T> {
        Exported { skeleton, target }
    }
}

impl<T: Send + Sync> RemoteTarget for Exported<T> {
    fn attribute(&self, key: &str) -> Option<String> {
        match key {
            ATTR_REMOTE_CLASS => Some(self.skeleton.interface().name().to_string()),
            _ => None,
        }
    }

    fn reference(&self, url: &str) -> RemoteRef {
        RemoteRef::Object(Handle::new(url))
    }

    fn invoke(&self, call: &Call<'_>) -> Option<Result<Value, Error>> {
        self.skeleton.invoke(&self.target, call)
    }
}

/// The in-process objects of an endpoint, by object id.
pub trait ObjectSource<T>: Send + Sync {
    fn find(&self, object_id: &str) -> Result<Arc<T>, Error>;
}

pub struct ObjectStore<T> {
    objects: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> ObjectStore<T> {
    pub fn new() -> ObjectStore<T> {
        ObjectStore {
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert<I: Into<String>>(&self, object_id: I, object: T) -> Arc<T> {
        let object = Arc::new(object);
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(object_id.into(), Arc::clone(&object));
        }
        object
    }

    pub fn remove(&self, object_id: &str) -> Option<Arc<T>> {
        self.objects
            .write()
            .ok()
            .and_then(|mut objects| objects.remove(object_id))
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ObjectStore<T> {
    fn default() -> ObjectStore<T> {
        ObjectStore::new()
    }
}

impl<T: Send + Sync> ObjectSource<T> for ObjectStore<T> {
    fn find(&self, object_id: &str) -> Result<Arc<T>, Error> {
        self.objects
            .read()
            .ok()
            .and_then(|objects| objects.get(object_id).cloned())
            .ok_or_else(|| Error::NotFound(String::from(object_id)))
    }
}

/// An endpoint serving many objects of one interface, addressed by
/// `?id=<objectId>`, plus an optional home that answers calls without an id.
pub struct ObjectServer<H, T> {
    home: Option<(Skeleton<H>, Arc<H>)>,
    remote: Skeleton<T>,
    objects: Arc<dyn ObjectSource<T>>,
    codec: IdentityCodec,
}

impl<H, T> ObjectServer<H, T> {
    pub fn new(
        remote: Skeleton<T>,
        objects: Arc<dyn ObjectSource<T>>,
        codec: IdentityCodec,
    ) -> ObjectServer<H, T> {
        ObjectServer {
            home: None,
            remote,
            objects,
            codec,
        }
    }

    pub fn with_home(mut self, skeleton: Skeleton<H>, home: Arc<H>) -> ObjectServer<H, T> {
        self.home = Some((skeleton, home));
        self
    }
}

impl<H: Send + Sync, T: Send + Sync> RemoteTarget for ObjectServer<H, T> {
    fn attribute(&self, key: &str) -> Option<String> {
        match key {
            ATTR_HOME_CLASS | ATTR_FACTORY_CLASS => self
                .home
                .as_ref()
                .map(|(skeleton, _)| skeleton.interface().name().to_string()),
            ATTR_REMOTE_CLASS => Some(self.remote.interface().name().to_string()),
            ATTR_PRIMARY_KEY_CLASS => Some(self.codec.shape().to_string()),
            _ => None,
        }
    }

    fn reference(&self, url: &str) -> RemoteRef {
        RemoteRef::Home(HomeHandle::new(url))
    }

    fn invoke(&self, call: &Call<'_>) -> Option<Result<Value, Error>> {
        let call = Call {
            codec: Some(&self.codec),
            ..*call
        };
        match call.object_id {
            Some(id) => {
                if !self.remote.handles(call.method) {
                    return None;
                }
                if let Err(e) = self.codec.decode_key(id) {
                    return Some(Err(e));
                }
                match self.objects.find(id) {
                    Ok(object) => self.remote.invoke(&object, &call),
                    Err(e) => Some(Err(e)),
                }
            }
            None => {
                let (skeleton, home) = self.home.as_ref()?;
                skeleton.invoke(home, &call)
            }
        }
    }
}

/// A decoded call as it arrived at the server.
pub struct Request {
    head: RequestHead,
    message: FastMessage,
    endpoint: String,
}

impl Request {
    pub fn new(head: RequestHead, message: FastMessage, endpoint: String) -> Request {
        Request {
            head,
            message,
            endpoint,
        }
    }

    pub fn id(&self) -> u32 {
        self.message.id
    }

    pub fn method(&self) -> &str {
        self.message.method()
    }

    pub fn object_id(&self) -> Option<&str> {
        self.head.object_id()
    }

    pub fn authorization(&self) -> Option<&str> {
        self.head.attribute(AUTHORIZATION)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn args(&self) -> Result<Args, Error> {
        Args::from_frame(&self.message.data.d)
    }
}

/// Collects the reply frames for one request.
#[derive(Default)]
pub struct Response {
    buf: BytesMut,
    replies: usize,
}

impl Response {
    pub fn new() -> Response {
        Response::default()
    }

    pub fn write_reply(
        &mut self,
        msg_id: u32,
        method: &str,
        outcome: &Result<Value, Fault>,
    ) -> io::Result<()> {
        let msg = match outcome {
            Ok(value) => FastMessage::value_reply(msg_id, method, value.clone()),
            Err(fault) => FastMessage::fault_reply(msg_id, method, fault),
        };
        protocol::encode_msg(&msg, &mut self.buf)?;
        self.replies += 1;
        Ok(())
    }

    /// Reply frames written so far.
    pub fn replies(&self) -> usize {
        self.replies
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }
}

pub enum DispatchTarget {
    Object(Arc<dyn RemoteTarget>),
    Naming(NamingNode),
}

pub struct Dispatcher {
    target: DispatchTarget,
    log: Logger,
}

impl Dispatcher {
    pub fn new(target: Arc<dyn RemoteTarget>, log: Option<&Logger>) -> Dispatcher {
        Dispatcher::with_target(DispatchTarget::Object(target), log)
    }

    pub fn naming(node: NamingNode, log: Option<&Logger>) -> Dispatcher {
        Dispatcher::with_target(DispatchTarget::Naming(node), log)
    }

    fn with_target(target: DispatchTarget, log: Option<&Logger>) -> Dispatcher {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Dispatcher { target, log }
    }

    pub fn target(&self) -> &DispatchTarget {
        &self.target
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        match &self.target {
            DispatchTarget::Object(target) => target.attribute(key),
            DispatchTarget::Naming(node) => node.attribute(key),
        }
    }

    /// Serve one request, writing exactly one reply frame. Protocol errors
    /// raised by a handler are returned untouched for the transport to
    /// frame.
    pub fn service(&self, request: &Request, response: &mut Response) -> Result<(), Error> {
        let method = request.method();
        debug!(self.log, "servicing call"; "endpoint" => request.endpoint(),
               "method" => method, "id" => request.id());

        let outcome = match request.args() {
            Ok(args) => {
                let call = Call {
                    method,
                    args: &args,
                    object_id: request.object_id(),
                    endpoint: request.endpoint(),
                    authorization: request.authorization(),
                    codec: None,
                };
                let invoked = panic::catch_unwind(AssertUnwindSafe(|| match &self.target {
                    DispatchTarget::Object(target) => target.invoke(&call),
                    DispatchTarget::Naming(node) => node.invoke(&call),
                }))
                .unwrap_or_else(|payload| {
                    Some(Err(Error::Application(format!(
                        "handler panicked: {}",
                        panic_message(payload.as_ref())
                    ))))
                });
                match invoked {
                    Some(Ok(value)) => Ok(value),
                    Some(Err(e @ Error::Protocol { .. })) => return Err(e),
                    Some(Err(e)) => {
                        warn!(self.log, "call failed"; "method" => method, "err" => %e);
                        Err(Fault::service_exception(&e))
                    }
                    None => self.fallback(&call),
                }
            }
            Err(e) => {
                warn!(self.log, "unreadable arguments"; "method" => method, "err" => %e);
                Err(Fault::service_exception(&e))
            }
        };

        response
            .write_reply(request.id(), method, &outcome)
            .map_err(|e| Error::Marshal(format!("unable to encode reply: {}", e)))
    }

    /// Introspection pseudo-methods, answered for every target.
    fn fallback(&self, call: &Call<'_>) -> Result<Value, Fault> {
        match call.method {
            "getAttribute" => {
                let key: String = call.arg(0).map_err(|e| Fault::service_exception(&e))?;
                Ok(self.attribute(&key).map(Value::String).unwrap_or(Value::Null))
            }
            "list" => Ok(Value::Null),
            _ => {
                debug!(self.log, "no such method"; "method" => call.method);
                Err(Fault::no_method(call.method))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    use crate::identity::{KeyShape, ScalarType};
    use crate::protocol::{FastMessageStatus, FAULT_NO_METHOD, FAULT_SERVICE};

    struct Calculator;

    fn calculator() -> Arc<dyn RemoteTarget> {
        let skeleton = Skeleton::builder(
            InterfaceDef::new("calculator")
                .method("add", 2)
                .method("explode", 0)
                .method("deny", 0)
                .method("crash", 0),
        )
        .method("add", |_: &Calculator, call| {
            Ok(call.arg::<i64>(0)? + call.arg::<i64>(1)?)
        })
        .method("explode", |_: &Calculator, _| -> Result<Value, Error> {
            Err(Error::Application(String::from("boom")))
        })
        .method("deny", |_: &Calculator, _| -> Result<Value, Error> {
            Err(Error::Protocol {
                status: 403,
                message: String::from("denied"),
            })
        })
        .method("crash", |_: &Calculator, _| -> Result<Value, Error> {
            let empty: Vec<i64> = Vec::new();
            Ok(json!(empty[3]))
        })
        .build()
        .unwrap();
        Arc::new(Exported::new(skeleton, Arc::new(Calculator)))
    }

    fn request(method: &str, args: Value) -> Request {
        let message = FastMessage::call(1, method, match args {
            Value::Array(values) => values,
            other => vec![other],
        });
        Request::new(RequestHead::new("/calc"), message, String::from("fast://h/calc"))
    }

    fn service(method: &str, args: Value) -> (Result<(), Error>, Vec<FastMessage>) {
        let dispatcher = Dispatcher::new(calculator(), None);
        let mut response = Response::new();
        let result = dispatcher.service(&request(method, args), &mut response);
        let replies = response.replies();
        let mut buf = response.into_bytes();
        let mut frames = Vec::new();
        while let Ok(msg) = FastMessage::parse(&buf) {
            let size = msg.msg_size.unwrap();
            frames.push(msg);
            let _ = buf.split_to(size);
        }
        assert_eq!(replies, frames.len());
        (result, frames)
    }

    #[test]
    fn value_reply() {
        let (result, frames) = service("add", json!([2, 3]));

        assert!(result.is_ok());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status, FastMessageStatus::Data);
        assert_eq!(frames[0].clone().into_reply().unwrap(), json!(5));
    }

    #[test]
    fn application_error_becomes_service_fault() {
        let (result, frames) = service("explode", json!([]));

        assert!(result.is_ok());
        assert_eq!(frames.len(), 1);
        match frames[0].clone().into_reply() {
            Err(Error::Fault(fault)) => {
                assert_eq!(fault.code, FAULT_SERVICE);
                assert_eq!(fault.message, "boom");
                assert_eq!(fault.detail.unwrap()["kind"], json!("application"));
            }
            other => panic!("expected a fault, got {:?}", other),
        }
    }

    #[test]
    fn bad_arguments_still_get_one_reply() {
        let (_, frames) = service("add", json!(["two", 3]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status, FastMessageStatus::Error);

        let (_, frames) = service("add", json!([2]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status, FastMessageStatus::Error);
    }

    #[test]
    fn protocol_errors_go_to_the_transport() {
        let (result, frames) = service("deny", json!([]));

        assert!(matches!(result, Err(Error::Protocol { status: 403, .. })));
        assert!(frames.is_empty());
    }

    #[test]
    fn panicking_handler_still_gets_a_fault() {
        let (result, frames) = service("crash", json!([]));

        assert!(result.is_ok());
        assert_eq!(frames.len(), 1);
        match frames[0].clone().into_reply() {
            Err(Error::Fault(fault)) => {
                assert_eq!(fault.code, FAULT_SERVICE);
                assert!(fault.message.contains("handler panicked"));
                assert!(fault.message.contains("index out of bounds"));
            }
            other => panic!("expected a fault, got {:?}", other),
        }
    }

    #[test]
    fn unknown_method_is_no_method_fault() {
        let (_, frames) = service("divide", json!([1, 0]));

        assert_eq!(frames.len(), 1);
        match frames[0].clone().into_reply() {
            Err(e) => assert_eq!(e.fault_code(), Some(FAULT_NO_METHOD)),
            Ok(v) => panic!("unexpected value {}", v),
        }
    }

    #[test]
    fn attributes_answer_through_fallback() {
        let (_, frames) = service("getAttribute", json!(["remote-class"]));
        assert_eq!(frames[0].clone().into_reply().unwrap(), json!("calculator"));

        let (_, frames) = service("getAttribute", json!(["home-class"]));
        assert_eq!(frames[0].clone().into_reply().unwrap(), Value::Null);

        let (_, frames) = service("list", json!([]));
        assert_eq!(frames[0].clone().into_reply().unwrap(), Value::Null);
    }

    #[test]
    fn builder_checks_declared_methods() {
        let missing = Skeleton::<Calculator>::builder(
            InterfaceDef::new("calculator").method("add", 2),
        )
        .build();
        assert!(matches!(missing, Err(Error::Config(_))));

        let undeclared = Skeleton::<Calculator>::builder(InterfaceDef::new("calculator"))
            .method("sub", |_, _| Ok(0))
            .build();
        assert!(matches!(undeclared, Err(Error::Config(_))));
    }

    struct Counter(i64);

    #[test]
    fn object_server_routes_by_id() {
        let store = Arc::new(ObjectStore::new());
        store.insert("7", Counter(70));
        let skeleton = Skeleton::builder(InterfaceDef::new("counter").method("value", 0))
            .method("value", |c: &Counter, call| {
                assert!(call.key().is_ok());
                Ok(c.0)
            })
            .build()
            .unwrap();
        let server: ObjectServer<(), Counter> = ObjectServer::new(
            skeleton,
            store,
            IdentityCodec::new(KeyShape::Scalar(ScalarType::Long)),
        );
        let args = Args::default();
        let mut call = Call::new("value", &args, "fast://h/counter");

        assert!(server.invoke(&call).is_none());
        call.object_id = Some("7");
        assert_eq!(server.invoke(&call).unwrap().unwrap(), json!(70));
        call.object_id = Some("8");
        assert!(matches!(server.invoke(&call), Some(Err(Error::NotFound(_)))));
        call.object_id = Some("x");
        assert!(matches!(server.invoke(&call), Some(Err(Error::Decode { .. }))));
        assert_eq!(server.attribute("primary-key-class"), Some(String::from("long")));
        assert_eq!(server.attribute("home-class"), None);
    }
}
