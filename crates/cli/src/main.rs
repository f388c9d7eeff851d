/// minitor - minimal Tor client
///
/// Bootstraps from the directory authorities (or a cached consensus),
/// builds a guard-to-exit circuit and fetches a URL through it, or lists
/// the relays of the current consensus.
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use minitor_common::ClientConfig;
use minitor_core::{OnionRouter, TorClient};

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    cache: Option<PathBuf>,
    force: bool,
    hops: Option<usize>,
    list_routers: bool,
    json: bool,
    verbose: bool,
    help: bool,
    version: bool,
    url: Option<String>,
}

/// One relay in `--list-routers --json` output
#[derive(Serialize)]
struct RouterEntry<'a> {
    name: &'a str,
    fingerprint: String,
    ip: String,
    or_port: u16,
    dir_port: u16,
    flags: Vec<&'static str>,
}

impl<'a> From<&'a OnionRouter> for RouterEntry<'a> {
    fn from(router: &'a OnionRouter) -> Self {
        Self {
            name: &router.name,
            fingerprint: router.fingerprint.to_hex(),
            ip: router.ip.to_string(),
            or_port: router.or_port,
            dir_port: router.dir_port,
            flags: router.flags.keywords(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Run with --help to see available options");
            std::process::exit(1);
        }
    };

    if args.help {
        print_help();
        return Ok(());
    }
    if args.version {
        println!("minitor v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting minitor v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let mut client = TorClient::bootstrap(config).await?;

    if args.list_routers {
        print_routers(client.routers(), args.json)?;
        return Ok(());
    }

    client.build_circuit().await?;
    info!("Circuit established with {} hops", client.hop_count());

    if let Some(url) = &args.url {
        let response = client.http_get(url).await;
        client.close().await;
        let response = response.with_context(|| format!("GET {url} failed"))?;

        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "HTTP {} {}", response.status, response.reason)?;
        stdout.write_all(&response.body)?;
        stdout.flush()?;
    } else {
        println!("Circuit established with {} hops", client.hop_count());
        client.close().await;
    }

    Ok(())
}

/// Configuration file first, then explicit flags on top
fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            ClientConfig::from_file(path)?
        }
        None => ClientConfig::default(),
    };

    if let Some(cache) = &args.cache {
        config = config.with_cache_path(cache);
    }
    if args.force {
        config = config.with_force_download(true);
    }
    if let Some(hops) = args.hops {
        config = config.with_hop_count(hops);
        if config.hop_count != hops {
            warn!("Hop count {} out of range, using {}", hops, config.hop_count);
        }
    }
    Ok(config)
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "-V" | "--version" => parsed.version = true,
            "-v" | "--verbose" => parsed.verbose = true,
            "--force" => parsed.force = true,
            "--list-routers" => parsed.list_routers = true,
            "--json" => parsed.json = true,
            "--config" => parsed.config = Some(value(&mut args, "--config")?.into()),
            "--cache" => parsed.cache = Some(value(&mut args, "--cache")?.into()),
            "--hops" => {
                let hops = value(&mut args, "--hops")?;
                parsed.hops = Some(
                    hops.parse()
                        .with_context(|| format!("invalid hop count: {hops}"))?,
                );
            }
            other if other.starts_with('-') => bail!("Unknown option: {other}"),
            other => {
                if parsed.url.is_some() {
                    bail!("Unexpected argument: {other}");
                }
                parsed.url = Some(other.to_string());
            }
        }
    }
    Ok(parsed)
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .with_context(|| format!("{flag} requires a value"))
}

fn print_routers(routers: Vec<&OnionRouter>, json: bool) -> Result<()> {
    if json {
        let entries: Vec<RouterEntry> = routers.into_iter().map(RouterEntry::from).collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let mut stdout = std::io::stdout().lock();
    for router in &routers {
        writeln!(
            stdout,
            "{:<20} {:>15}:{:<5} {}",
            router.name, router.ip, router.or_port, router.flags
        )?;
    }
    writeln!(stdout, "{} routers", routers.len())?;
    Ok(())
}

/// Print help message
fn print_help() {
    println!("minitor - minimal Tor client");
    println!();
    println!("USAGE:");
    println!("    minitor [OPTIONS] [URL]");
    println!();
    println!("OPTIONS:");
    println!("    --config <FILE>   Load client configuration from a TOML file");
    println!("    --cache <FILE>    Consensus cache file");
    println!("    --force           Download a fresh consensus even if the cache is valid");
    println!("    --hops <N>        Circuit length (1-8, default 3)");
    println!("    --list-routers    Print the relays of the consensus and exit");
    println!("    --json            Print the relay list as JSON");
    println!("    -v, --verbose     Debug logging (RUST_LOG overrides)");
    println!("    -V, --version     Show version information");
    println!("    -h, --help        Show this help message");
    println!();
    println!("EXAMPLES:");
    println!("    # Fetch a page through a 3-hop circuit");
    println!("    minitor https://check.torproject.org/");
    println!();
    println!("    # Reuse a cached consensus and list its relays");
    println!("    minitor --cache consensus.txt --list-routers --json");
}
