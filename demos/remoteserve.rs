// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use clap::{crate_version, App, Arg, ArgMatches};
use serde_json::Value;
use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use fast_remote::identity::{
    generate_sharded_key, KeyValue, RandomIdGenerator, ScalarType,
};
use fast_remote::server;
use fast_remote::{
    Config, Error, Exported, IdentityCodec, InterfaceDef, KeyShape, ObjectServer,
    ObjectStore, PrimaryKey, Registry, Skeleton,
};

static APP: &str = "remoteserve";

struct Calculator;

struct CounterHome {
    store: Arc<ObjectStore<Counter>>,
    ids: RandomIdGenerator,
    log: Logger,
}

struct Counter {
    value: AtomicI64,
}

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Serves a calculator and a counter home over Fast")
        .version(crate_version!())
        .arg(
            Arg::with_name("config")
                .help("JSON configuration file")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .help("Address to listen on (Default: 127.0.0.1:2030)")
                .long("listen")
                .short("l")
                .takes_value(true),
        )
        .get_matches()
}

fn calculator() -> Result<Exported<Calculator>, Error> {
    let interface = InterfaceDef::new("calculator")
        .method("add", 2)
        .method("echo", 1);
    let skeleton = Skeleton::builder(interface)
        .method("add", |_: &Calculator, call| {
            Ok(call.arg::<f64>(0)? + call.arg::<f64>(1)?)
        })
        .method("echo", |_: &Calculator, call| call.arg::<Value>(0))
        .build()?;

    Ok(Exported::new(skeleton, Arc::new(Calculator)))
}

fn counters(config: &Config, log: &Logger) -> Result<ObjectServer<CounterHome, Counter>, Error> {
    let home_interface = InterfaceDef::new("counter-home").method("create", 1);
    let remote_interface = InterfaceDef::new("counter")
        .method("value", 0)
        .method("add", 1);

    let home = Skeleton::builder(home_interface)
        .method("create", |home: &CounterHome, call| {
            let start: i64 = call.arg(0)?;
            let key = generate_sharded_key(&home.ids);
            debug!(home.log, "creating counter"; "key" => &key, "start" => start);
            home.store.insert(
                key.clone(),
                Counter {
                    value: AtomicI64::new(start),
                },
            );
            call.handle_for(&PrimaryKey::from(KeyValue::String(key)))
        })
        .build()?;
    let remote = Skeleton::builder(remote_interface)
        .method("value", |counter: &Counter, _| {
            Ok(counter.value.load(Ordering::SeqCst))
        })
        .method("add", |counter: &Counter, call| {
            let delta: i64 = call.arg(0)?;
            Ok(counter.value.fetch_add(delta, Ordering::SeqCst) + delta)
        })
        .build()?;

    let store = Arc::new(ObjectStore::new());
    let home_target = CounterHome {
        store: Arc::clone(&store),
        ids: RandomIdGenerator::from_config(config),
        log: log.new(o!("home" => "counter")),
    };
    Ok(ObjectServer::new(
        remote,
        store,
        IdentityCodec::new(KeyShape::Scalar(ScalarType::String)),
    )
    .with_home(home, Arc::new(home_target)))
}

fn bind_all(registry: &Registry, config: &Config, log: &Logger) -> Result<(), Error> {
    let url = registry.bind("/math/calc", Arc::new(calculator()?))?;
    info!(log, "bound calculator"; "url" => url);
    let url = registry.bind("/counter", Arc::new(counters(config, log)?))?;
    info!(log, "bound counter home"; "url" => url);
    Ok(())
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let matches = parse_opts(APP.to_string());
    let mut config = match matches.value_of("config") {
        Some(path) => Config::from_file(path).unwrap_or_else(|e| {
            eprintln!("{}", e);
            process::exit(1)
        }),
        None => Config::default(),
    };
    if let Some(listen) = matches.value_of("listen") {
        config.listen_address = String::from(listen);
    }

    let registry = Arc::new(Registry::from_config(&config, Some(&root_log)));
    if let Err(e) = bind_all(&registry, &config, &root_log) {
        error!(root_log, "failed to bind targets"; "err" => %e);
        process::exit(1);
    }

    let listener = TcpListener::bind(config.listen_address.as_str())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to bind {}: {}", config.listen_address, e);
            process::exit(1)
        });

    server::serve(listener, registry, Some(&root_log)).await;
}
