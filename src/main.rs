use clap::Parser;
use log::{error, info};
use shared::SERVER_PORT;
use std::net::Ipv4Addr;
use std::process::ExitCode;

/// Authoritative-server multiplayer arena shooter core.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// "server" to host on port 7777, "npcs" to spawn bot clients, or a
    /// UDP port number to run an interactive client bound to it.
    mode: String,

    /// Bot count when mode is "npcs".
    count: Option<usize>,
}

fn main() -> ExitCode {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info to see log output");
    }

    let args = Args::parse();

    let result = match args.mode.as_str() {
        "server" => {
            info!("starting server");
            server::run_server().map_err(|e| e.to_string())
        }
        "npcs" => {
            let Some(count) = args.count else {
                error!("npcs mode needs a bot count, e.g. `wallrun npcs 4`");
                return ExitCode::FAILURE;
            };
            client::bot::run_npcs(Ipv4Addr::LOCALHOST, count).map_err(|e| e.to_string())
        }
        port => match port.parse::<u16>() {
            Ok(port) if port == SERVER_PORT => {
                error!("port {SERVER_PORT} is reserved for the server");
                return ExitCode::FAILURE;
            }
            Ok(port) => {
                info!("starting client on port {port}");
                client::run_client(
                    port,
                    Ipv4Addr::LOCALHOST,
                    "markymark",
                    client::input::IdleInput,
                )
                .map_err(|e| e.to_string())
            }
            Err(_) => {
                error!("expected \"server\", \"npcs <count>\" or a UDP port, got {port:?}");
                return ExitCode::FAILURE;
            }
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}
