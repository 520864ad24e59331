//! quic-dispatcher: server-side QUIC connection dispatcher
//!
//! This is the main entry point. Without a QUIC transport plugged in, the
//! binary admits connections with a logging session that records what it
//! receives, which is useful for exercising admission and time-wait
//! behaviour against real clients.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./quic-dispatcher
//!
//! # Run with custom configuration
//! ./quic-dispatcher -c /path/to/config.json
//!
//! # Run with environment overrides
//! QUIC_DISPATCHER_LOG_LEVEL=debug ./quic-dispatcher
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use tokio::signal;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

use quic_dispatcher::config::{load_config_with_env, DispatcherConfig};
use quic_dispatcher::dispatcher::{
    AcceptAll, HmacProofSigner, ProofValidator, Session, SessionContext, SessionFactory,
    SessionNotifier, SigningValidator, WriteStatus,
};
use quic_dispatcher::error::SessionError;
use quic_dispatcher::packet::ReceivedDatagram;
use quic_dispatcher::server::{DispatchServer, ShutdownHandle};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/quic-dispatcher/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("quic-dispatcher v{}", quic_dispatcher::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"quic-dispatcher v{}

Server-side QUIC connection dispatcher.

USAGE:
    quic-dispatcher [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/quic-dispatcher/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    QUIC_DISPATCHER_LISTEN_ADDR             Override listen address
    QUIC_DISPATCHER_LOG_LEVEL               Override log level (trace, debug, info, warn, error)
    QUIC_DISPATCHER_MAX_SESSIONS_PER_DRIVE  Override sessions created per drive
    RUST_LOG                                Additional tracing filter directives
",
        quic_dispatcher::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &DispatcherConfig) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Session that only records what it is given.
struct LoggingSession {
    notifier: SessionNotifier,
    datagrams: u64,
    bytes: u64,
}

impl Session for LoggingSession {
    fn deliver(&mut self, datagram: ReceivedDatagram) {
        self.datagrams += 1;
        self.bytes += datagram.len() as u64;
        debug!(
            "Session {} received {} bytes from {}",
            self.notifier.connection_id(),
            datagram.len(),
            datagram.peer_addr
        );
    }

    fn on_writable(&mut self) -> WriteStatus {
        WriteStatus::Done
    }

    fn is_closing(&self) -> bool {
        false
    }

    fn close(&mut self) {
        info!(
            "Session {} closed after {} datagrams ({} bytes)",
            self.notifier.connection_id(),
            self.datagrams,
            self.bytes
        );
    }
}

struct LoggingSessionFactory;

impl SessionFactory for LoggingSessionFactory {
    fn create(&mut self, context: SessionContext) -> Result<Box<dyn Session>, SessionError> {
        info!(
            "New session {} (server id {}) from {} (version {}, sni {:?}, alpn {:?})",
            context.connection_id,
            context.server_connection_id,
            context.client_addr,
            context.version,
            context.hello.server_name(),
            context.hello.alpn()
        );
        Ok(Box::new(LoggingSession {
            notifier: context.notifier,
            datagrams: 0,
            bytes: 0,
        }))
    }
}

fn build_validator(config: &DispatcherConfig) -> Result<Box<dyn ProofValidator>> {
    match config.validator.proof_key_bytes()? {
        Some(key) => {
            info!(
                "Signing proofs with HMAC, ALPN allow-list: {:?}",
                config.validator.alpn
            );
            Ok(Box::new(
                SigningValidator::new(HmacProofSigner::new(key))
                    .with_alpn(config.validator.alpn.clone()),
            ))
        }
        None => {
            info!("No proof key configured, accepting every handshake");
            Ok(Box::new(AcceptAll))
        }
    }
}

/// Main application entry point
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        quic_dispatcher::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    // Load configuration
    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("quic-dispatcher v{}", quic_dispatcher::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let validator = build_validator(&config)?;
    let server = DispatchServer::bind(&config, validator, Box::new(LoggingSessionFactory))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start dispatcher: {}", e))?;

    tokio::spawn(watch_signals(server.shutdown_handle()));

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let router = server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Dispatcher error: {}", e))?;

    let stats = router.stats().snapshot();
    info!(
        "Final stats: {} datagrams received, {} sessions created, {} rejected, {} resets sent",
        stats.packets_received, stats.sessions_created, stats.rejections, stats.stateless_resets
    );
    info!("Shutdown complete");

    Ok(())
}

/// Trigger shutdown on SIGINT or SIGTERM
async fn watch_signals(handle: ShutdownHandle) {
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT, initiating shutdown..."),
        () = wait_for_sigterm() => info!("Received SIGTERM, initiating shutdown..."),
    }
    handle.shutdown();
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await;
}
