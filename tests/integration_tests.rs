//! End-to-end tests over real loopback sockets: a live server, real
//! clients, and the raw wire format.

use client::input::{InputSample, InputSource, ScriptedInput};
use client::{ClientState, GameEvent};
use server::ServerState;
use shared::{SERVER_PORT, STARTING_HEALTH, TICK_TIME};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Runs a server on an ephemeral port in a background thread until the
/// returned guard is dropped.
struct TestServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start() -> Self {
        let server = ServerState::bind(0).expect("failed to bind test server");
        let addr = server.local_addr().expect("server has no local addr");
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut server = server;
                while !stop.load(Ordering::Relaxed) {
                    server.advance();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn pump(client: &mut ClientState, source: &mut dyn InputSource, ticks: usize) {
    for _ in 0..ticks {
        client.net_update(TICK_TIME);
        client.update(TICK_TIME, source);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn client_connects_and_receives_snapshots() {
    let server = TestServer::start();
    let mut client =
        ClientState::connect(0, server.addr, "tester").expect("connect should succeed");

    assert!(client.connected);
    assert!(client.player_idx >= 0);

    let mut idle = client::input::IdleInput;
    pump(&mut client, &mut idle, 60);

    assert!(
        client.snapshot_count() >= 2,
        "expected a stream of snapshots, got {}",
        client.snapshot_count()
    );
    assert_eq!(client.local_player.health, STARTING_HEALTH);
    assert!(
        client.local_player.position.y > 0.0,
        "reconciled player should sit on the map"
    );
}

#[test]
fn predicted_movement_survives_reconciliation() {
    let server = TestServer::start();
    let mut client =
        ClientState::connect(0, server.addr, "runner").expect("connect should succeed");

    let mut idle = client::input::IdleInput;
    pump(&mut client, &mut idle, 20);

    // The spawn point is random; at least one cardinal direction has
    // open ground in front of it.
    let mut best_moved = 0.0f32;
    for quarter_turn in 0..4 {
        let start = client.local_player.position;
        let mut forward = ScriptedInput::new(vec![InputSample {
            move_z: -1.0,
            yaw: quarter_turn as f32 * std::f32::consts::FRAC_PI_2,
            ..Default::default()
        }]);
        pump(&mut client, &mut forward, 30);

        best_moved = best_moved.max((client.local_player.position - start).length());
        if best_moved > 1.0 {
            break;
        }
    }

    assert!(
        best_moved > 1.0,
        "player should have moved under input, best distance {best_moved}"
    );
}

#[test]
fn second_client_appears_in_interpolated_frame() {
    let server = TestServer::start();
    let mut alice =
        ClientState::connect(0, server.addr, "alice").expect("alice should connect");
    let mut bob = ClientState::connect(0, server.addr, "bob").expect("bob should connect");

    assert_ne!(alice.player_idx, bob.player_idx);

    let mut idle_a = client::input::IdleInput;
    let mut idle_b = client::input::IdleInput;
    let mut bob_seen = false;
    for _ in 0..200 {
        alice.net_update(TICK_TIME);
        alice.update(TICK_TIME, &mut idle_a);
        bob.net_update(TICK_TIME);
        bob.update(TICK_TIME, &mut idle_b);
        if alice.frame.iter().any(|p| p.player_idx == bob.player_idx) {
            bob_seen = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    assert!(bob_seen, "alice's interpolated frame never included bob");
}

#[test]
fn leaving_client_produces_player_left_event() {
    let server = TestServer::start();
    let mut alice =
        ClientState::connect(0, server.addr, "alice").expect("alice should connect");
    let bob = ClientState::connect(0, server.addr, "bob").expect("bob should connect");
    let bob_idx = bob.player_idx;

    // Bob's transport dies with him; the server notices the silence.
    drop(bob);

    let mut idle = client::input::IdleInput;
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut saw_leave = false;
    while Instant::now() < deadline && !saw_leave {
        pump(&mut alice, &mut idle, 10);
        saw_leave = alice.events.iter().any(|event| {
            matches!(event, GameEvent::PlayerLeft { player_idx, .. } if *player_idx == bob_idx)
        });
    }

    assert!(saw_leave, "alice never learned that bob left");
}

/// Speaks the raw wire format at the server: a hand-packed connect
/// request must come back as a hand-parseable connect accept.
#[test]
fn raw_wire_format_handshake() {
    let server = TestServer::start();

    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind raw socket");
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();

    // Header: type=5 (connect request), flags=1 (reliable), sequence=1,
    // ack_bits=0, ack=0 — all little endian, 10 bytes.
    let mut packet = vec![5u8, 1, 1, 0, 0, 0, 0, 0, 0, 0];
    let mut name = [0u8; 32];
    name[..3].copy_from_slice(b"raw");
    packet.extend_from_slice(&name);
    assert_eq!(packet.len(), 42);

    socket.send_to(&packet, server.addr).unwrap();

    let mut buf = [0u8; 1500];
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "no connect accept arrived");
        let Ok((len, _)) = socket.recv_from(&mut buf) else {
            continue;
        };
        if len < 10 || buf[0] != 6 {
            // Snapshots and retransmits share the stream; skip them.
            continue;
        }

        // Payload: server_time f32, player_index i8.
        assert_eq!(len, 10 + 5);
        let server_time = f32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
        let player_index = buf[14] as i8;
        assert!(server_time >= 0.0);
        assert_eq!(player_index, 0, "first player gets slot 0");
        break;
    }
}

#[test]
fn client_times_out_without_a_server() {
    // A socket that never answers stands in for a dead server.
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = silent.local_addr().unwrap();

    let started = Instant::now();
    let result = ClientState::connect(0, addr, "nobody");
    let waited = started.elapsed();

    assert!(result.is_err(), "connect must fail without an accept");
    assert!(
        waited >= Duration::from_secs(4),
        "gave up suspiciously fast: {waited:?}"
    );
}

#[test]
fn reserved_port_stays_free_for_the_server() {
    // The normative port number is part of the protocol.
    assert_eq!(SERVER_PORT, 7777);
}
