//! # Game Server Library
//!
//! The authoritative side of the game. The server owns the only real
//! simulation: it drains client inputs, advances physics at a fixed
//! 60 Hz, resolves shots against its position history so latency doesn't
//! decide duels, and broadcasts quantized snapshots at 20 Hz for clients
//! to interpolate and reconcile against.
//!
//! Module layout:
//! - [`game`]: the tick loop state machine ([`game::ServerState`])
//! - [`combat`]: shot rays and the two-phase obstacle/player trace
//! - [`connection`]: per-client bookkeeping and input FIFOs

pub mod combat;
pub mod connection;
pub mod game;

use log::info;
use shared::net::NetError;
use shared::{SERVER_PORT, TICK_TIME};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use game::ServerState;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Net(#[from] NetError),
}

/// Binds the well-known port and runs the tick loop until the process is
/// killed. Sleeps away whatever is left of each tick.
pub fn run_server() -> Result<(), ServerError> {
    let mut server = ServerState::bind(SERVER_PORT)?;
    info!("server listening on 0.0.0.0:{SERVER_PORT}");

    loop {
        let frame_start = Instant::now();

        server.advance();

        let elapsed = frame_start.elapsed().as_secs_f32();
        let remaining = TICK_TIME - elapsed;
        if remaining > 0.001 {
            std::thread::sleep(Duration::from_secs_f32(remaining));
        }
    }
}
