use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn, Level};

use kadmos::{cli, Dht, Id};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind and announce, e.g. 127.0.0.1:9001
    #[arg(long)]
    listen: SocketAddr,

    /// Address of an existing node to join through
    #[arg(long)]
    bootstrap: Option<SocketAddr>,

    /// Explicit 40 character hex node id (random otherwise)
    #[arg(long)]
    id: Option<Id>,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = 800)]
    request_timeout_ms: u64,

    /// Seconds between republish passes over origin keys
    #[arg(long, default_value_t = 900)]
    republish_interval_secs: u64,
}

fn main() -> kadmos::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();

    let mut builder = Dht::builder()
        .listen(args.listen)
        .request_timeout(Duration::from_millis(args.request_timeout_ms))
        .republish_interval(Duration::from_secs(args.republish_interval_secs));

    if let Some(id) = args.id {
        builder = builder.id(id);
    }

    // A process supervisor can select the role and bootstrap target via
    // the environment; explicit flags win.
    if let Some(address) = args.bootstrap.or_else(bootstrap_from_env) {
        builder = builder.bootstrap(address);
    }

    let dht = builder.build()?;
    info!(id = %dht.id(), address = %dht.local_addr(), "Ready; put/get/exit on stdin");

    let stdin = io::stdin();
    cli::run(&dht, stdin.lock(), io::stdout())?;

    dht.shutdown();

    Ok(())
}

/// `KADMOS_ROLE=node` joins through `KADMOS_BOOTSTRAP` (host:port);
/// `KADMOS_ROLE=seed` starts a fresh network.
fn bootstrap_from_env() -> Option<SocketAddr> {
    let role = std::env::var("KADMOS_ROLE").ok()?;
    if role.eq_ignore_ascii_case("seed") {
        return None;
    }

    let target = std::env::var("KADMOS_BOOTSTRAP").ok()?;
    match target.to_socket_addrs() {
        Ok(mut addresses) => addresses.next(),
        Err(error) => {
            warn!(?error, target = %target, "Could not resolve bootstrap target");
            None
        }
    }
}
