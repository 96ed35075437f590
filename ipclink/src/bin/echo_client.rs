use std::process;
use std::time::Duration;

use anyhow::Context;
use serde_json::{Map, Value};

use ipclink::logging::init_tracing;
use ipclink::{Client, ClientConfig};

struct Options {
    host: String,
    port: Option<u16>,
    discovery_port: u16,
    secret: String,
    timeout: Option<Duration>,
    endpoint: String,
    args: Map<String, Value>,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: ipclink-echo-client [options] <endpoint> [key=value ...]");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <endpoint>               Endpoint to call");
            eprintln!("  key=value                Argument; value is parsed as JSON, else taken as a string");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --host <host>            Server host [default: localhost]");
            eprintln!("  --port <port>            Main port; skips discovery");
            eprintln!("  --discovery-port <port>  Discovery port [default: 20000]");
            eprintln!("  --secret <secret>        Shared secret [default: $IPCLINK_SECRET]");
            eprintln!("  --timeout-ms <ms>        Request timeout");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let defaults = ClientConfig::default();
    let mut host = defaults.host;
    let mut port = None;
    let mut discovery_port = defaults.discovery_port;
    let mut secret = std::env::var("IPCLINK_SECRET").unwrap_or_default();
    let mut timeout = None;
    let mut endpoint: Option<String> = None;
    let mut call_args = Map::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                port = Some(parse_number(args.get(i), "--port")?);
            }
            "--discovery-port" => {
                i += 1;
                discovery_port = parse_number(args.get(i), "--discovery-port")?;
            }
            "--secret" => {
                i += 1;
                secret = args.get(i).ok_or("--secret requires a value")?.clone();
            }
            "--timeout-ms" => {
                i += 1;
                timeout = Some(Duration::from_millis(parse_number(args.get(i), "--timeout-ms")?));
            }
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg if endpoint.is_none() => endpoint = Some(arg.to_string()),
            arg => {
                let (key, raw) = arg
                    .split_once('=')
                    .ok_or_else(|| format!("expected key=value, got '{arg}'"))?;
                let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
                call_args.insert(key.to_string(), value);
            }
        }
        i += 1;
    }

    let endpoint = endpoint.ok_or("missing required argument: <endpoint>")?;
    Ok(Options {
        host,
        port,
        discovery_port,
        secret,
        timeout,
        endpoint,
        args: call_args,
    })
}

fn parse_number<T: std::str::FromStr>(value: Option<&String>, flag: &str) -> Result<T, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .parse()
        .map_err(|_| format!("{flag}: invalid number '{value}'"))
}

async fn run(options: Options) -> anyhow::Result<()> {
    let mut config = ClientConfig::new(options.secret)
        .with_host(options.host)
        .with_discovery_port(options.discovery_port);
    if let Some(port) = options.port {
        config = config.with_port(port);
    }
    if let Some(timeout) = options.timeout {
        config = config.with_request_timeout(timeout);
    }

    let client = Client::new(config);

    let result = if options.port.is_none() {
        let node = client.discover().await.context("discovery failed")?;
        tracing::info!(%node, "Discovered server");
        client.request_on(&node, &options.endpoint, &options.args).await
    } else {
        client.request(&options.endpoint, &options.args).await
    };
    let result = result.with_context(|| format!("request to '{}' failed", options.endpoint))?;
    client.close().await;

    let json = serde_json::to_string_pretty(&result).context("failed to format result")?;
    println!("{json}");
    Ok(())
}
