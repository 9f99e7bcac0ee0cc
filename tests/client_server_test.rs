// Copyright 2020 Joyent, Inc.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use bytes::BytesMut;
use serde_json::{json, Value};
use slog::{info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;
use tokio_test::block_on;

use fast_remote::protocol::{encode_msg, FastMessage, FAULT_SERVICE};
use fast_remote::server;
use fast_remote::{
    Config, ContainerRegistry, Error, Exported, Handle, InterfaceDef, NamingEntry,
    NamingResolver, Registry, Skeleton,
};

const ADDR: &str = "127.0.0.1:56652";

struct Calculator;

fn calculator_interface() -> InterfaceDef {
    InterfaceDef::new("calculator")
        .method("add", 2)
        .method("echo", 1)
        .method("explode", 0)
        .method("crash", 0)
}

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

#[tokio::main]
async fn run_server(barrier: Arc<Barrier>) {
    let root_log = test_log();
    let registry = Arc::new(Registry::new(format!("fast://{}", ADDR), Some(&root_log)));

    let skeleton = Skeleton::builder(calculator_interface())
        .method("add", |_: &Calculator, call| {
            Ok(call.arg::<i64>(0)? + call.arg::<i64>(1)?)
        })
        .method("echo", |_: &Calculator, call| call.arg::<Value>(0))
        .method("explode", |_: &Calculator, _| -> Result<Value, Error> {
            Err(Error::Application(String::from("boom")))
        })
        .method("crash", |_: &Calculator, _| -> Result<Value, Error> {
            let empty: Vec<i64> = Vec::new();
            Ok(json!(empty[3]))
        })
        .build()
        .unwrap();
    registry
        .bind(
            "/math/calc",
            Arc::new(Exported::new(skeleton, Arc::new(Calculator))),
        )
        .unwrap();

    let addr = ADDR.parse::<SocketAddr>().unwrap();
    let listener = TcpListener::bind(addr).await.expect("failed to bind");
    info!(root_log, "listening for calls"; "address" => addr);

    barrier.wait();

    server::serve(listener, registry, Some(&root_log)).await;
}

fn containers() -> ContainerRegistry {
    let config = Config::from_json(r#"{"connect_timeout_ms": 2000, "read_timeout_ms": 5000}"#)
        .unwrap();
    let containers = ContainerRegistry::from_config(&config, None);
    containers.register_interface(calculator_interface());
    containers
}

async fn run_client() -> Result<(), Error> {
    let containers = containers();
    let calc = Handle::new(format!("fast://{}/math/calc", ADDR)).resolve(&containers)?;

    assert_eq!(calc.call::<i64>("add", vec![json!(2), json!(3)])?, 5);

    for i in 1..20 {
        let data = "a".repeat(i * 1000);
        let echoed: String = calc.call("echo", vec![json!(data)])?;
        assert_eq!(echoed.len(), i * 1000);
    }

    match calc.invoke("explode", vec![]) {
        Err(Error::Fault(fault)) => {
            assert_eq!(fault.code, FAULT_SERVICE);
            assert_eq!(fault.message, "boom");
        }
        other => panic!("expected a fault, got {:?}", other),
    }

    // A panicking handler still answers with a fault.
    match calc.invoke("crash", vec![]) {
        Err(e) => assert_eq!(e.fault_code(), Some(FAULT_SERVICE)),
        Ok(v) => panic!("unexpected value {}", v),
    }
    assert_eq!(calc.call::<i64>("add", vec![json!(1), json!(1)])?, 2);

    let root = NamingResolver::new(format!("fast://{}", ADDR), Arc::new(containers), None);
    assert_eq!(root.list()?, vec!["math"]);
    match root.lookup_path("math/calc")? {
        Some(NamingEntry::Object(reference)) => {
            assert_eq!(reference.url(), format!("fast://{}/math/calc", ADDR))
        }
        other => panic!("expected an object, got {:?}", other),
    }

    Ok(())
}

fn raw_exchange(request: &[u8]) -> String {
    let mut stream = TcpStream::connect(ADDR).unwrap();
    stream.write_all(request).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[test]
fn client_server_comms() {
    let barrier = Arc::new(Barrier::new(2));
    let barrier_clone = barrier.clone();
    let _h_server = thread::spawn(move || run_server(barrier_clone));

    barrier.clone().wait();
    let result = block_on(run_client());
    assert!(result.is_ok(), "client failed: {:?}", result);

    // Nothing bound: status and text, no frames.
    let mut request = BytesMut::from(&b"FAST/1 /nowhere\r\n\r\n"[..]);
    encode_msg(&FastMessage::call(1, "ping", vec![]), &mut request).unwrap();
    let response = raw_exchange(&request);
    assert!(response.starts_with("FAST/1 404 "));
    assert!(response.ends_with("nothing is bound at /nowhere"));

    // Not a preamble at all.
    let response = raw_exchange(b"HELLO\r\n\r\n");
    assert!(response.starts_with("FAST/1 400 "));
}
