/*!
 * cinderkv server
 *
 * Binds the RESP-2 TCP listener and runs the event loop until SIGINT or
 * SIGTERM. The only command-line argument is an optional port.
 */

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use cinderkv::{Server, Store, DEFAULT_MAX_MEMORY, DEFAULT_PORT};
use signal_hook::consts::{SIGINT, SIGTERM};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn usage(prog: &str) {
    eprintln!("Usage: {prog} [PORT]");
    eprintln!("  PORT - Port number to listen on (default: {DEFAULT_PORT})");
}

/// Parse the optional positional port argument. Ports outside 1-65535 and
/// non-numeric arguments are rejected.
fn parse_port(arg: Option<&str>) -> Result<u16, String> {
    match arg {
        None => Ok(DEFAULT_PORT),
        Some(s) => match s.parse::<u16>() {
            Ok(0) | Err(_) => Err(format!("Invalid port number: {s}")),
            Ok(port) => Ok(port),
        },
    }
}

fn main() -> Result<()> {
    // Respects RUST_LOG, e.g. RUST_LOG=debug for per-connection logging.
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let port = match parse_port(args.get(1).map(String::as_str)) {
        Ok(port) => port,
        Err(msg) => {
            eprintln!("{msg}");
            usage(&args[0]);
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown)).context("install SIGINT handler")?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))
        .context("install SIGTERM handler")?;

    let store = Arc::new(Store::new(DEFAULT_MAX_MEMORY));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let mut server = Server::bind(addr, store)?;

    println!("cinderkv listening on {}", server.local_addr());
    server.run(&shutdown)?;
    println!("cinderkv shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_port;
    use cinderkv::DEFAULT_PORT;

    #[test]
    fn port_parsing() {
        assert_eq!(parse_port(None), Ok(DEFAULT_PORT));
        assert_eq!(parse_port(Some("9001")), Ok(9001));
        assert_eq!(parse_port(Some("65535")), Ok(65535));
        assert!(parse_port(Some("0")).is_err());
        assert!(parse_port(Some("65536")).is_err());
        assert!(parse_port(Some("-1")).is_err());
        assert!(parse_port(Some("port")).is_err());
    }
}
