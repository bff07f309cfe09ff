//! # Game Client Library
//!
//! The predicting, reconciling, interpolating side of the game. Each tick
//! the client gathers input, sends it to the server, applies it locally
//! through the same shared simulation functions, and stores it in a
//! history ring. Snapshots coming back are held in a small buffer and
//! rendered slightly in the past so there is always a pair to interpolate
//! between; the local player alone is drawn at its predicted position and
//! corrected by replaying unacknowledged inputs whenever the server's
//! answer arrives.
//!
//! Rendering, windowing and raw input live outside this crate; they plug
//! in through [`input::InputSource`] and read [`state::ClientState`]'s
//! `frame`, `local_player`, `events` and `shot_trails`.
//!
//! Module layout:
//! - [`state`]: prediction, reconciliation, packet intake
//! - [`interp`]: snapshot interpolation and the adaptive delay controller
//! - [`input`]: the input contract plus idle/scripted sources
//! - [`bot`]: autonomous clients that fill a server for testing

pub mod bot;
pub mod input;
pub mod interp;
pub mod state;

use input::InputSource;
use log::info;
use shared::net::NetError;
use shared::{SERVER_PORT, TICK_TIME};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use state::{ClientState, GameEvent};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("could not register the server as a peer")]
    AddPeer,
    #[error("server did not accept the connection in time")]
    ConnectTimeout,
    #[error("connection to the server was lost")]
    ConnectionLost,
    #[error("failed to spawn bot thread: {0}")]
    Thread(std::io::Error),
}

/// Connects to the local server and runs the 60 Hz client loop until the
/// connection drops. `source` supplies the inputs; the embedding shell is
/// expected to call this from its own thread and read the state it
/// shares.
pub fn run_client(
    bind_port: u16,
    server_ip: Ipv4Addr,
    player_name: &str,
    mut source: impl InputSource,
) -> Result<(), ClientError> {
    let server_addr = SocketAddr::from((server_ip, SERVER_PORT));
    let mut client = ClientState::connect(bind_port, server_addr, player_name)?;
    info!("entering client loop as player {}", client.player_idx);

    loop {
        let frame_start = Instant::now();

        if !client.net_update(TICK_TIME) {
            return Err(ClientError::ConnectionLost);
        }
        client.update(TICK_TIME, &mut source);

        let elapsed = frame_start.elapsed().as_secs_f32();
        let remaining = TICK_TIME - elapsed;
        if remaining > 0.001 {
            std::thread::sleep(Duration::from_secs_f32(remaining));
        }
    }
}
