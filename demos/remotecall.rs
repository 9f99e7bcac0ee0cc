// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Arc;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;

use fast_remote::{Config, ContainerRegistry, Error, InterfaceDef};

static APP: &str = "remotecall";
static DEFAULT_URL: &str = "fast://127.0.0.1:2030/math/calc";

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making one remote method call")
        .version(crate_version!())
        .arg(
            Arg::with_name("url")
                .help("URL of the remote object (Default: fast://127.0.0.1:2030/math/calc)")
                .long("url")
                .short("u")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of the remote method")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded argument array")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("auth")
                .help("Basic auth token")
                .long("auth")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .help("JSON configuration file")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .get_matches()
}

fn call(
    config: &Config,
    url: &str,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, Error> {
    let containers = ContainerRegistry::from_config(config, None);
    let interface = Arc::new(InterfaceDef::new("remotecall").method(method, args.len()));
    let proxy = containers
        .get_or_create(url)
        .create_proxy(&interface, url)?;
    proxy.invoke(method, args)
}

fn main() {
    let matches = parse_opts(APP.to_string());
    let mut config = match matches.value_of("config") {
        Some(path) => Config::from_file(path).unwrap_or_else(|e| {
            eprintln!("{}", e);
            process::exit(1)
        }),
        None => Config::default(),
    };
    if let Some(token) = matches.value_of("auth") {
        config.basic_auth = Some(String::from(token));
    }
    let url = matches.value_of("url").unwrap_or(DEFAULT_URL);
    let method = matches.value_of("method").unwrap_or_else(|| {
        eprintln!("Failed to parse method argument as String");
        process::exit(1)
    });
    let args = match value_t!(matches, "args", Value).unwrap_or_else(|e| e.exit()) {
        Value::Array(args) => args,
        other => {
            eprintln!("Arguments must be a JSON array, got {}", other);
            process::exit(1)
        }
    };

    match call(&config, url, method, args) {
        Ok(value) => println!("{}", value),
        Err(e) => {
            eprintln!("Error: {}", e);
            if let Some(cause) = e.cause_chain() {
                eprintln!("Caused by: {}", cause);
            }
            process::exit(1)
        }
    }
}
