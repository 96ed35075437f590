use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use serde_json::{Value, json};

use ipclink::logging::init_tracing;
use ipclink::{
    Component, ComponentRoutes, HandlerError, LoggingHost, Request, Server, ServerConfig,
};

struct Options {
    host: String,
    port: u16,
    discovery_port: Option<u16>,
    secret: String,
}

/// Sample component: a guild with a member counter.
struct Guild {
    name: String,
    members: AtomicU64,
}

impl Component for Guild {
    fn ipc_routes(routes: &mut ComponentRoutes<Self>) {
        routes
            .route("get_member_count", |guild: Arc<Guild>, _req| async move {
                Ok::<_, HandlerError>(guild.members.load(Ordering::Relaxed))
            })
            .route("join", |guild: Arc<Guild>, req: Request| async move {
                let count: u64 = req.get_as("count")?.unwrap_or(1);
                let total = guild.members.fetch_add(count, Ordering::Relaxed) + count;
                Ok::<_, HandlerError>(json!({ "guild": guild.name, "members": total }))
            });
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!(
                "Usage: ipclink-echo-server [--host <host>] [--port <port>] [--discovery-port <port> | --no-discovery] [--secret <secret>]"
            );
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --host <host>            Bind address [default: localhost]");
            eprintln!("  --port <port>            Main port [default: 8765]");
            eprintln!("  --discovery-port <port>  Discovery port [default: 20000]");
            eprintln!("  --no-discovery           Do not start the discovery responder");
            eprintln!("  --secret <secret>        Shared secret [default: $IPCLINK_SECRET]");
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
    let defaults = ServerConfig::default();
    let mut options = Options {
        host: defaults.host,
        port: defaults.port,
        discovery_port: Some(defaults.discovery_port),
        secret: std::env::var("IPCLINK_SECRET").unwrap_or_default(),
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                options.host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                options.port = parse_port(args.get(i), "--port")?;
            }
            "--discovery-port" => {
                i += 1;
                options.discovery_port = Some(parse_port(args.get(i), "--discovery-port")?);
            }
            "--no-discovery" => options.discovery_port = None,
            "--secret" => {
                i += 1;
                options.secret = args.get(i).ok_or("--secret requires a value")?.clone();
            }
            "--help" | "-h" => return Err("".to_string()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

fn parse_port(value: Option<&String>, flag: &str) -> Result<u16, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .parse()
        .map_err(|_| format!("{flag}: invalid port '{value}'"))
}

async fn run(options: Options) -> anyhow::Result<()> {
    let mut config = ServerConfig::new(options.secret)
        .with_host(options.host)
        .with_port(options.port)
        .with_discovery(options.discovery_port.is_some());
    if let Some(port) = options.discovery_port {
        config = config.with_discovery_port(port);
    }

    let mut server = Server::new(Arc::new(LoggingHost), config);
    server
        .route("echo", |req: Request| async move {
            Ok::<_, HandlerError>(Value::Object(req.into_data()))
        })
        .route("add", |req: Request| async move {
            let a: f64 = req.require("a")?;
            let b: f64 = req.require("b")?;
            Ok::<_, HandlerError>(a + b)
        })
        .route("fail", |req: Request| async move {
            let reason: Option<String> = req.get_as("reason")?;
            Err::<Value, _>(HandlerError::msg(
                reason.unwrap_or_else(|| "requested failure".to_string()),
            ))
        })
        .add_component(Arc::new(Guild {
            name: "demo".to_string(),
            members: AtomicU64::new(0),
        }));

    let info = server.start().await.context("failed to start IPC server")?;
    tracing::info!(
        addr = %info.addr,
        endpoints = ?server.serving().unwrap_or_default(),
        "Echo server running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    server.stop().await;
    Ok(())
}
