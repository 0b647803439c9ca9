//! Process launcher for PGAS jobs.
//!
//! Command form expected by the deployment tooling:
//! `pcjrunner <entry> <localPort> <node0Host> <node0Port> <totalThreadCount>
//! <localThreadIds> [propertiesBlob]`
//!
//! Exit codes: 0 normal, 1 user exception, 2 launch/config failure,
//! 3 network failure.

mod programs;

use clap::{App, Arg};
use pcj::logging;
use pcj::{ErrorKind, Properties, Settings};
use serde_derive::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::process;

const EXIT_OK: i32 = 0;
const EXIT_USER: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_NETWORK: i32 = 3;

/// Optional TOML configuration merged below the command line.
#[derive(Deserialize, Default)]
struct RunnerConfig {
    host: Option<String>,
    log_level: Option<String>,
    #[serde(default)]
    properties: HashMap<String, String>,
}

impl RunnerConfig {
    fn load<P: AsRef<Path>>(path: P) -> Result<RunnerConfig, String> {
        serdeconv::from_toml_file(path).map_err(|err| err.to_string())
    }
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let matches = App::new("pcjrunner")
        .about("Launches one process of a PGAS job")
        .arg(Arg::with_name("entry").required(true).index(1).help("Registered entry point name"))
        .arg(Arg::with_name("localPort").required(true).index(2))
        .arg(Arg::with_name("node0Host").required(true).index(3))
        .arg(Arg::with_name("node0Port").required(true).index(4))
        .arg(Arg::with_name("totalThreadCount").required(true).index(5))
        .arg(
            Arg::with_name("localThreadIds")
                .required(true)
                .index(6)
                .help("Comma separated global thread ids homed on this process"),
        )
        .arg(
            Arg::with_name("propertiesBlob")
                .index(7)
                .help("Semicolon separated key=value runtime properties"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .help("TOML configuration file merged below the command line"),
        )
        .arg(
            Arg::with_name("host")
                .long("host")
                .takes_value(true)
                .help("Externally reachable host of this process"),
        )
        .arg(
            Arg::with_name("coordinator")
                .long("coordinator")
                .help("Force this process to act as node 0"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .help("trace, debug, info, warning, error or critical"),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => match RunnerConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error loading config file: {}", err);
                return EXIT_CONFIG;
            }
        },
        None => RunnerConfig::default(),
    };

    let mut props = Properties::default();

    for (key, value) in &config.properties {
        if let Err(err) = props.apply(key, value) {
            eprintln!("Error in config file: {}", err);
            return EXIT_CONFIG;
        }
    }

    if let Some(blob) = matches.value_of("propertiesBlob") {
        if let Err(err) = props.apply_blob(blob) {
            eprintln!("Error in properties: {}", err);
            return EXIT_CONFIG;
        }
    }

    let entry = matches.value_of("entry").unwrap();
    let local_port = match parse::<u16>(&matches, "localPort") {
        Ok(value) => value,
        Err(code) => return code,
    };
    let node0_host = matches.value_of("node0Host").unwrap().to_string();
    let node0_port = match parse::<u16>(&matches, "node0Port") {
        Ok(value) => value,
        Err(code) => return code,
    };
    let total_threads = match parse::<u32>(&matches, "totalThreadCount") {
        Ok(value) => value,
        Err(code) => return code,
    };

    let local_threads = match matches
        .value_of("localThreadIds")
        .unwrap()
        .split(',')
        .map(|id| id.trim().parse::<u32>())
        .collect::<Result<Vec<u32>, _>>()
    {
        Ok(ids) => ids,
        Err(_) => {
            eprintln!("Error parsing localThreadIds");
            return EXIT_CONFIG;
        }
    };

    let host = matches
        .value_of("host")
        .map(str::to_string)
        .or_else(|| config.host.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let coordinator = matches.is_present("coordinator")
        || (local_port == node0_port && (node0_host == host || is_local_host(&node0_host)));

    let level = matches
        .value_of("log-level")
        .map(str::to_string)
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());

    let job = match programs::lookup(entry) {
        Some(job) => job,
        None => {
            eprintln!("Unknown entry point `{}`; known: {}", entry, programs::names().join(", "));
            return EXIT_CONFIG;
        }
    };

    let settings = Settings {
        host,
        port: local_port,
        node0: format!("{}:{}", node0_host, node0_port),
        coordinator,
        total_threads,
        local_threads,
        props,
        logger: Some(logging::term_logger(&level)),
    };

    match pcj::start(settings, job) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("Job failed: {}", err);
            match err.kind() {
                ErrorKind::UserException => EXIT_USER,
                ErrorKind::Config => EXIT_CONFIG,
                _ => EXIT_NETWORK,
            }
        }
    }
}

fn is_local_host(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == "::1"
}

fn parse<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str) -> Result<T, i32> {
    matches.value_of(name).unwrap().parse().map_err(|_| {
        eprintln!("Error parsing {}", name);
        EXIT_CONFIG
    })
}
