use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use config::{Config, File};
use serde::Deserialize;

use dns_resolver::cache::CacheConfig;
use dns_resolver::{agent::AgentParams, agent::Strategy, agent::Transport, facade::Resolver, roothints};
use dns_types::protocol::types::{
    DomainName, QueryClass, QueryType, Question, RecordClass, RecordType, RecordTypeWithData,
    ResourceRecord,
};

fn format_rdata(rr: &ResourceRecord) -> String {
    match &rr.rtype_with_data {
        RecordTypeWithData::A { address } => address.to_string(),
        RecordTypeWithData::AAAA { address } => address.to_string(),
        RecordTypeWithData::NS { nsdname } => nsdname.to_string(),
        RecordTypeWithData::CNAME { cname } => cname.to_string(),
        RecordTypeWithData::PTR { ptrdname } => ptrdname.to_string(),
        RecordTypeWithData::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => format!("{mname} {rname} {serial} {refresh} {retry} {expire} {minimum}"),
        RecordTypeWithData::MX { preference, exchange } => format!("{preference} {exchange}"),
        RecordTypeWithData::TXT { strings } => format!("{strings:?}"),
        RecordTypeWithData::HINFO { cpu, os } => format!("{cpu:?} {os:?}"),
        RecordTypeWithData::MINFO { rmailbx, emailbx } => format!("{rmailbx} {emailbx}"),
        RecordTypeWithData::WKS { address, protocol, .. } => format!("{address} {protocol}"),
        RecordTypeWithData::Unimplemented { rtype, octets } => format!("({rtype:?} {} bytes)", octets.len()),
    }
}

fn print_section(heading: &str, rrs: &[ResourceRecord]) {
    if rrs.is_empty() {
        return;
    }

    println!("\n;; {heading}");
    for rr in rrs {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            rr.name,
            rr.ttl,
            rr.rclass,
            rr.rtype_with_data.rtype(),
            format_rdata(rr)
        );
    }
}

fn begin_logging() {
    let log_format = env::var("RUST_LOG_FORMAT").unwrap_or_default();
    let logger = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env());
    if log_format.split(',').any(|s| s == "json") {
        logger.json().init();
    } else {
        logger.init();
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct AgentSetting {
    name: String,
    address: SocketAddr,
    #[serde(default = "default_timeout_millis")]
    timeout_millis: u64,
    #[serde(default)]
    priority: u32,
}

fn default_timeout_millis() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize, Default)]
struct Settings {
    #[serde(default)]
    agents: Vec<AgentSetting>,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    cache_capacity: Option<usize>,
    #[serde(default)]
    cache_max_ttl_seconds: Option<u64>,
    #[serde(default)]
    root_hints_path: Option<String>,
    #[serde(default)]
    root_hints_url: Option<String>,
}

impl Settings {
    fn load(filename: &str) -> Self {
        Config::builder()
            .add_source(File::with_name(filename).required(false))
            .build()
            .and_then(config::Config::try_deserialize)
            .unwrap_or_default()
    }
}

fn parse_strategy(name: &str) -> Strategy {
    match name {
        "priority" => Strategy::Priority,
        "speed" => Strategy::Speed,
        "round_robin" => Strategy::RoundRobin,
        "random" => Strategy::Random,
        "iterative" => Strategy::Iterative,
        other => Strategy::Named(other.to_string()),
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Parser)]
/// DNS recursive lookup utility
struct Args {
    /// Domain name to resolve
    #[clap(value_parser)]
    domain: DomainName,

    /// Query type to resolve
    #[clap(default_value_t = QueryType::Record(RecordType::A), value_parser)]
    qtype: QueryType,

    /// Path to a YAML settings file with the upstream agent list,
    /// cache configuration, and root hints location
    #[clap(short, long, default_value = "dnsq.yaml", value_parser)]
    config: String,

    /// Override the server-selection strategy configured in the
    /// settings file ("priority", "speed", "round_robin", "random",
    /// "iterative", or an agent name)
    #[clap(long, value_parser)]
    strategy: Option<String>,
}

#[tokio::main]
async fn main() {
    begin_logging();
    let args = Args::parse();
    let settings = Settings::load(&args.config);

    let strategy = args
        .strategy
        .or_else(|| settings.strategy.clone())
        .map_or(Strategy::Priority, |s| parse_strategy(&s));

    let mut cache_config = CacheConfig::default();
    if let Some(capacity) = settings.cache_capacity {
        cache_config.capacity = capacity;
    }
    if let Some(max_ttl_seconds) = settings.cache_max_ttl_seconds {
        cache_config.max_ttl_millis = max_ttl_seconds * 1000;
    }

    let mut agents: Vec<AgentParams> = settings
        .agents
        .iter()
        .map(|a| AgentParams {
            name: a.name.clone(),
            address: a.address,
            timeout_millis: a.timeout_millis,
            priority: a.priority,
        })
        .collect();

    if matches!(strategy, Strategy::Iterative) {
        let path = settings
            .root_hints_path
            .map(PathBuf::from)
            .unwrap_or_else(roothints::default_path);
        let url = settings.root_hints_url.unwrap_or_else(|| roothints::DEFAULT_URL.to_string());

        match roothints::load(&path, &url).await {
            Ok(hints) => {
                agents = roothints::root_addresses(&hints)
                    .into_iter()
                    .enumerate()
                    .map(|(i, address)| AgentParams {
                        name: format!("root-{i}"),
                        address: SocketAddr::new(address, 53),
                        timeout_millis: 5000,
                        priority: 0,
                    })
                    .collect();
            }
            Err(error) => {
                eprintln!("could not load root hints: {error}");
                process::exit(1);
            }
        }
    }

    let resolver = Resolver::builder().agents(agents).cache_config(cache_config).build();

    let question = Question {
        name: args.domain,
        qtype: args.qtype,
        qclass: QueryClass::Record(RecordClass::IN),
    };

    println!(";; QUESTION");
    println!("{}\t{}\t{}", question.name, question.qclass, question.qtype);

    match resolver.resolve(question, strategy, Transport::Udp).await {
        Ok(response) => {
            print_section("ANSWER", &response.answers);
            print_section("AUTHORITY", &response.authority);
            print_section("ADDITIONAL", &response.additional);
        }
        Err(error) => {
            println!("\n;; ANSWER");
            println!("; {error}");
            process::exit(1);
        }
    }
}
