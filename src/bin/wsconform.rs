//! `wsconform`: serve WebSocket conformance scenarios, or probe a server.
//!
//! ```bash
//! wsconform serve --bind 127.0.0.1:8880
//! wsconform probe 127.0.0.1:8880 \
//!     '/websocket/tests/hybi/reserved-bits?compressed=true&bitNumber=1' --deflate
//! ```

use std::net::SocketAddr;
#[cfg(feature = "tls-rustls")]
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use wsconform::trace::{DEFAULT_FILTER, init_tracing};
use wsconform::{
    Config, FixtureServer, Limits, ProbeOptions, ScenarioRegistry, Timeouts, probe,
};

#[derive(Parser, Debug)]
#[command(
    name = "wsconform",
    version,
    about = "WebSocket conformance fixture server"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = DEFAULT_FILTER)]
    log: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve every built-in scenario
    Serve(ServeArgs),

    /// Connect to a server and print the first frame it sends
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = wsconform::config::DEFAULT_BIND_ADDR)]
    bind: SocketAddr,

    /// Only accept upgrades from these origins (repeatable)
    #[arg(long = "allow-origin")]
    allowed_origins: Vec<String>,

    /// Do not send a Close frame after the scenario's data
    #[arg(long)]
    no_close: bool,

    /// Maximum upgrade request size in bytes
    #[arg(long, default_value_t = Limits::default().max_handshake_size)]
    max_handshake_size: usize,

    /// Seconds to wait for the upgrade request
    #[arg(long, default_value_t = Timeouts::default().handshake.as_secs())]
    handshake_timeout: u64,

    /// Seconds allowed for writing the response and frames
    #[arg(long, default_value_t = Timeouts::default().write.as_secs())]
    write_timeout: u64,

    /// Milliseconds to wait for the client's close after our Close frame
    #[arg(long, default_value_t = 2000)]
    linger_ms: u64,

    /// PEM certificate chain; serves wss:// together with --key
    #[cfg(feature = "tls-rustls")]
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[cfg(feature = "tls-rustls")]
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Server address
    addr: String,

    /// Request target, path plus query
    resource: String,

    /// Offer permessage-deflate
    #[arg(long)]
    deflate: bool,

    /// Seconds before giving up
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Largest frame accepted from the server, in bytes
    #[arg(long, default_value_t = Limits::default().max_frame_size)]
    max_frame_size: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Probe(args) => run_probe(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "wsconform failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(args: ServeArgs) -> wsconform::Result<()> {
    let mut config = Config::new()
        .with_bind_addr(args.bind)
        .with_limits(Limits::new(
            args.max_handshake_size,
            Limits::default().max_frame_size,
        ))
        .with_timeouts(Timeouts::new(
            Duration::from_secs(args.handshake_timeout),
            Duration::from_secs(args.write_timeout),
            Duration::from_millis(args.linger_ms),
        ))
        .with_close_after_transfer(!args.no_close);
    if !args.allowed_origins.is_empty() {
        config = config.with_allowed_origins(args.allowed_origins.clone());
    }

    let registry = ScenarioRegistry::with_defaults();
    info!(scenarios = ?registry.paths(), "registered scenarios");

    let server = FixtureServer::bind(config, registry).await?;
    let server = attach_tls(server, &args)?;

    server
        .run_until(async {
            // Without a signal handler the server simply runs until killed.
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[cfg(feature = "tls-rustls")]
fn attach_tls(server: FixtureServer, args: &ServeArgs) -> wsconform::Result<FixtureServer> {
    let (Some(cert), Some(key)) = (&args.cert, &args.key) else {
        return Ok(server);
    };
    let acceptor = wsconform::tls::TlsAcceptor::from_pem_files(cert, key)
        .map_err(|e| wsconform::Error::Config(e.to_string()))?;
    info!("serving wss://");
    Ok(server.with_tls(acceptor))
}

#[cfg(not(feature = "tls-rustls"))]
fn attach_tls(server: FixtureServer, _args: &ServeArgs) -> wsconform::Result<FixtureServer> {
    Ok(server)
}

async fn run_probe(args: ProbeArgs) -> wsconform::Result<()> {
    let mut options = ProbeOptions::new(args.addr.clone(), args.resource)
        .with_deflate(args.deflate)
        .with_timeout(Duration::from_secs(args.timeout));
    options.limits.max_frame_size = args.max_frame_size;

    let report = probe(args.addr.as_str(), &options).await?;
    println!("extensions: {:?}", report.response.extensions);
    println!(
        "frame: fin={} rsv1={} rsv2={} rsv3={} opcode={} payload={:?}",
        report.frame.fin,
        report.frame.rsv1,
        report.frame.rsv2,
        report.frame.rsv3,
        report.frame.opcode,
        String::from_utf8_lossy(report.frame.payload())
    );
    Ok(())
}
