//! The authoritative simulation: input draining, lag-compensated combat,
//! respawns and the snapshot broadcast.

use crate::combat;
use crate::connection::ClientConnection;
use crate::ServerError;
use log::{debug, info, warn};
use shared::codec;
use shared::map::{self, Map};
use shared::net::{Transport, UnknownSenderPolicy};
use shared::physics;
use shared::protocol::{
    ConnectAccept, ConnectRequest, InputMessage, MessageType, PlayerDiedMessage,
    PlayerLeftMessage, SnapshotMessage, WireMessage,
};
use shared::{
    Player, Shot, Snapshot, BULLET_DAMAGE, HISTORY_SIZE, INPUT_BUTTON_SHOOT, MAX_PLAYERS,
    MAX_SHOTS, NETWORK_UPDATE_INTERVAL, SNAPSHOT_TIME, STARTING_HEALTH, TICK_TIME,
};
use std::collections::VecDeque;
use std::net::Ipv4Addr;

pub const RESPAWN_TIME: f32 = 1.5;

#[derive(Debug, Clone, Copy)]
struct Respawn {
    player_index: i8,
    respawn_time: f32,
}

/// The whole server: transport, arena, the live frame, and the history
/// ring that makes shots fair for everyone despite latency differences —
/// when player 1 fired, it was at time x; where was everyone at x?
pub struct ServerState {
    net: Transport,
    map: Map,
    frame: Snapshot,
    history: VecDeque<Snapshot>,
    clients: [Option<ClientConnection>; MAX_PLAYERS],
    dead_players: VecDeque<Respawn>,
    /// Shots accumulated since the last broadcast.
    new_shots: Vec<Shot>,
    time: f32,
    snapshot_accumulator: f32,
    network_accumulator: f32,
}

impl ServerState {
    /// Binds the transport and readies an empty arena. The server accepts
    /// packets from unknown addresses; that is how clients join.
    pub fn bind(port: u16) -> Result<Self, ServerError> {
        let mut net = Transport::bind(Ipv4Addr::UNSPECIFIED, port)?;
        net.set_unknown_sender_policy(UnknownSenderPolicy::AcceptPeers);

        Ok(Self {
            net,
            map: map::generate(),
            frame: Snapshot::default(),
            history: VecDeque::with_capacity(HISTORY_SIZE),
            clients: Default::default(),
            dead_players: VecDeque::with_capacity(MAX_PLAYERS),
            new_shots: Vec::with_capacity(MAX_SHOTS),
            time: 0.0,
            snapshot_accumulator: 0.0,
            network_accumulator: 0.0,
        })
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.net.local_addr()
    }

    pub fn player(&self, idx: usize) -> &Player {
        &self.frame.players[idx]
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.iter().flatten().count()
    }

    /// Runs one 60 Hz tick: drain packets, simulate, respawn, and on their
    /// own cadence broadcast snapshots and service the transport. The
    /// caller owns the sleep to the tick boundary.
    pub fn advance(&mut self) {
        self.time += TICK_TIME;

        self.process_packets();
        self.tick(TICK_TIME);
        self.update_respawns();

        self.snapshot_accumulator += TICK_TIME;
        if self.snapshot_accumulator >= SNAPSHOT_TIME {
            self.broadcast_snapshot();
            self.snapshot_accumulator = 0.0;
        }

        self.network_accumulator += TICK_TIME;
        if self.network_accumulator >= NETWORK_UPDATE_INTERVAL {
            self.network_update(self.network_accumulator);
            self.network_accumulator = 0.0;
        }
    }

    fn find_player_for_peer(&self, peer_id: u32) -> Option<usize> {
        self.clients
            .iter()
            .position(|c| c.as_ref().is_some_and(|c| c.peer_id == peer_id))
    }

    fn process_packets(&mut self) {
        while let Some(polled) = self.net.poll() {
            match MessageType::from_u8(polled.msg_type) {
                Some(MessageType::ConnectRequest) => {
                    match shared::protocol::decode::<ConnectRequest>(self.net.payload(&polled)) {
                        Ok(req) => self.handle_connect_request(polled.from, &req),
                        Err(e) => debug!("bad connect request: {e}"),
                    }
                }
                Some(MessageType::ClientInput) => {
                    match shared::protocol::decode::<InputMessage>(self.net.payload(&polled)) {
                        Ok(input) => self.handle_input(polled.from, input),
                        Err(e) => debug!("bad input message: {e}"),
                    }
                }
                _ => {
                    debug!(
                        "unhandled message type {} from peer {:#010x}",
                        polled.msg_type, polled.from
                    );
                }
            }
            self.net.release(&polled);
        }
    }

    pub(crate) fn handle_connect_request(&mut self, peer_id: u32, req: &ConnectRequest) {
        // A retransmitted request from a joined player changes nothing;
        // the reliable CONNECT_ACCEPT is already in flight.
        if self.find_player_for_peer(peer_id).is_some() {
            return;
        }

        let Some(player_idx) = self.clients.iter().position(Option::is_none) else {
            warn!("no free player slots, ignoring connect from {peer_id:#010x}");
            return;
        };

        let name = req.name();
        self.clients[player_idx] = Some(ClientConnection::new(peer_id, name.clone()));

        let entity = &mut self.frame.players[player_idx];
        *entity = Player::default();
        entity.player_idx = player_idx as i8;
        entity.position = map::spawn_point(&self.map);
        entity.health = STARTING_HEALTH;

        info!("player {player_idx} connected (peer {peer_id:#010x}, name {name})");

        let accept = ConnectAccept {
            server_time: self.time,
            player_index: player_idx as i8,
        };
        self.net.send_reliable(peer_id, &accept);
    }

    pub(crate) fn handle_input(&mut self, peer_id: u32, input: InputMessage) {
        let Some(player_idx) = self.find_player_for_peer(peer_id) else {
            return;
        };
        if let Some(client) = self.clients[player_idx].as_mut() {
            if !client.push_input(input) {
                debug!("input buffer full for player {player_idx}");
            }
        }
    }

    /// Drains each living player's buffered inputs in order and advances
    /// the simulation, then records the frame into the lag-compensation
    /// history.
    pub(crate) fn tick(&mut self, dt: f32) {
        for player_idx in 0..MAX_PLAYERS {
            // Network conditions can deliver zero inputs one tick and two
            // the next. Skipping sequences at or below last_processed
            // keeps stale or duplicated packets from replaying.
            let accepted: Vec<InputMessage> = {
                let Some(client) = self.clients[player_idx].as_mut() else {
                    continue;
                };
                if !self.frame.players[player_idx].alive() {
                    continue;
                }

                let mut accepted = Vec::new();
                while let Some(input) = client.pop_input() {
                    if input.sequence_num <= client.last_processed {
                        continue;
                    }
                    client.last_processed = input.sequence_num;
                    accepted.push(input);
                }
                accepted
            };

            for input in accepted {
                if input.buttons & INPUT_BUTTON_SHOOT != 0 {
                    self.lag_compensated_shot(player_idx as i8, input.shot_time);
                }

                let mut entity = self.frame.players[player_idx];
                physics::apply_input(&mut entity, &input, dt);
                let others = self.frame.players;
                physics::apply_physics(&mut entity, &self.map, &others, dt);
                self.frame.players[player_idx] = entity;
            }
        }

        for (player_idx, client) in self.clients.iter().enumerate() {
            if let Some(client) = client {
                self.frame.players[player_idx].last_processed_seq = client.last_processed;
            }
        }

        self.frame.timestamp = self.time;
        if self.history.len() == HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(self.frame);
    }

    /// Resolves one shot against the world as the shooter saw it.
    ///
    /// The newest history frame at or before the client's reported shot
    /// time supplies the shooter's stance and the target positions;
    /// interpolating between frames would be more exact but each shot has
    /// a different time step, so the test is coarsest for a target moving
    /// fast in one direction. Damage lands on the *current* player.
    pub(crate) fn lag_compensated_shot(&mut self, shooter_idx: i8, shot_time: f32) {
        let historical: Snapshot = self
            .history
            .iter()
            .rev()
            .find(|snapshot| snapshot.timestamp <= shot_time)
            .copied()
            .unwrap_or(self.frame);

        let Some(shooter) = historical.player(shooter_idx) else {
            return;
        };

        let mut shot = combat::create_shot(shooter, self.time);
        let hit_player = combat::trace_shot(&mut shot, &self.map, &historical.players);

        if self.new_shots.len() < MAX_SHOTS {
            self.new_shots.push(shot);
        }

        let Some(hit_idx) = hit_player else {
            return;
        };

        let target = &mut self.frame.players[hit_idx as usize];
        if !target.active() {
            return;
        }
        let was_alive = target.alive();
        target.health = target.health.saturating_sub(BULLET_DAMAGE);

        if target.alive() || !was_alive {
            return;
        }

        info!("player {shooter_idx} killed player {hit_idx}");

        if self.dead_players.len() < MAX_PLAYERS {
            self.dead_players.push_back(Respawn {
                player_index: hit_idx,
                respawn_time: self.time + RESPAWN_TIME,
            });
        }

        self.broadcast_reliable(&PlayerDiedMessage {
            killer_idx: shooter_idx,
            killed_idx: hit_idx,
        });
    }

    /// Revives everyone whose respawn time has come. The queue is time
    /// ordered, so the scan stops at the first entry still pending.
    pub(crate) fn update_respawns(&mut self) {
        while let Some(respawn) = self.dead_players.front().copied() {
            if respawn.respawn_time > self.time {
                break;
            }
            self.dead_players.pop_front();

            let entity = &mut self.frame.players[respawn.player_index as usize];
            if entity.active() {
                entity.position = map::spawn_point(&self.map);
                entity.health = STARTING_HEALTH;
                info!("respawned player {}", respawn.player_index);
            }
        }
    }

    /// Quantizes the live frame plus accumulated shots and fires it at
    /// every client, unreliably: the next snapshot supersedes a lost one.
    pub(crate) fn broadcast_snapshot(&mut self) {
        let mut msg = SnapshotMessage {
            server_time: self.time,
            ..Default::default()
        };

        for entity in &self.frame.players {
            if !entity.active() {
                continue;
            }
            msg.players[msg.player_count as usize] = codec::quantize_player(entity);
            msg.player_count += 1;
        }

        msg.shot_count = self.new_shots.len().min(MAX_SHOTS) as u8;
        for (i, shot) in self.new_shots.iter().take(MAX_SHOTS).enumerate() {
            msg.shots[i] = codec::quantize_shot(shot);
        }

        self.broadcast_unreliable(&msg);
        self.new_shots.clear();
    }

    fn network_update(&mut self, dt: f32) {
        for peer_id in self.net.update(dt) {
            self.drop_client(peer_id);
        }
    }

    /// Called when the transport gives up on a peer: frees the slot and
    /// tells the survivors.
    pub(crate) fn drop_client(&mut self, peer_id: u32) {
        let Some(player_idx) = self.find_player_for_peer(peer_id) else {
            return;
        };

        self.clients[player_idx] = None;
        let entity = &mut self.frame.players[player_idx];
        entity.player_idx = -1;
        entity.health = 0;

        info!("player {player_idx} disconnected (peer {peer_id:#010x})");

        self.broadcast_reliable(&PlayerLeftMessage {
            player_idx: player_idx as i8,
        });
    }

    fn broadcast_reliable<M: WireMessage>(&mut self, msg: &M) {
        for player_idx in 0..MAX_PLAYERS {
            if let Some(client) = &self.clients[player_idx] {
                let peer_id = client.peer_id;
                self.net.send_reliable(peer_id, msg);
            }
        }
    }

    fn broadcast_unreliable<M: WireMessage>(&mut self, msg: &M) {
        for player_idx in 0..MAX_PLAYERS {
            if let Some(client) = &self.clients[player_idx] {
                let peer_id = client.peer_id;
                self.net.send_unreliable(peer_id, msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use glam::Vec3;
    use shared::INPUT_BUTTON_JUMP;
    use std::net::{SocketAddr, UdpSocket};

    fn test_server() -> ServerState {
        ServerState::bind(0).unwrap()
    }

    /// A throwaway socket whose address stands in for a client.
    fn fake_peer(server: &mut ServerState) -> (u32, UdpSocket) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr: SocketAddr = socket.local_addr().unwrap();
        let peer_id = server.net.add_peer(addr).unwrap();
        (peer_id, socket)
    }

    fn connect(server: &mut ServerState, name: &str) -> (u32, UdpSocket, usize) {
        let (peer_id, socket) = fake_peer(server);
        server.handle_connect_request(peer_id, &ConnectRequest::new(name));
        let idx = server.find_player_for_peer(peer_id).unwrap();
        (peer_id, socket, idx)
    }

    fn input(seq: u32, buttons: u8, shot_time: f32) -> InputMessage {
        InputMessage {
            sequence_num: seq,
            buttons,
            shot_time,
            ..Default::default()
        }
    }

    #[test]
    fn connect_assigns_first_free_slot() {
        let mut server = test_server();
        let (_, _s1, idx1) = connect(&mut server, "alice");
        let (_, _s2, idx2) = connect(&mut server, "bob");

        assert_eq!(idx1, 0);
        assert_eq!(idx2, 1);

        let player = server.player(0);
        assert!(player.active());
        assert_eq!(player.health, STARTING_HEALTH);
        assert!(map::is_clear(&server.map, player.position));
        assert_eq!(server.clients[0].as_ref().unwrap().player_name, "alice");
    }

    #[test]
    fn duplicate_connect_request_is_ignored() {
        let mut server = test_server();
        let (peer_id, _socket, idx) = connect(&mut server, "alice");

        server.handle_connect_request(peer_id, &ConnectRequest::new("alice"));
        assert_eq!(server.connected_clients(), 1);
        assert_eq!(server.find_player_for_peer(peer_id), Some(idx));
    }

    #[test]
    fn full_server_ignores_connect() {
        let mut server = test_server();
        let mut sockets = Vec::new();
        for i in 0..MAX_PLAYERS {
            let (_, socket, _) = connect(&mut server, &format!("p{i}"));
            sockets.push(socket);
        }
        assert_eq!(server.connected_clients(), MAX_PLAYERS);

        let (extra_peer, _extra) = fake_peer(&mut server);
        server.handle_connect_request(extra_peer, &ConnectRequest::new("late"));
        assert_eq!(server.connected_clients(), MAX_PLAYERS);
        assert_eq!(server.find_player_for_peer(extra_peer), None);
    }

    #[test]
    fn tick_applies_inputs_and_advances_last_processed() {
        let mut server = test_server();
        let (peer_id, _socket, idx) = connect(&mut server, "alice");

        let mut msg = input(1, 0, 0.0);
        msg.move_z = -1.0;
        server.handle_input(peer_id, msg);
        let before = server.player(idx).position;

        server.time += TICK_TIME;
        server.tick(TICK_TIME);

        assert_ne!(server.player(idx).position, before);
        assert_eq!(server.clients[idx].as_ref().unwrap().last_processed, 1);
        assert_eq!(server.player(idx).last_processed_seq, 1);
    }

    #[test]
    fn stale_and_duplicate_inputs_are_skipped() {
        let mut server = test_server();
        let (peer_id, _socket, idx) = connect(&mut server, "alice");

        server.handle_input(peer_id, input(3, 0, 0.0));
        server.tick(TICK_TIME);
        assert_eq!(server.clients[idx].as_ref().unwrap().last_processed, 3);

        // An old sequence and a duplicate both get dropped; neither may
        // trigger the jump they carry.
        server.handle_input(peer_id, input(2, INPUT_BUTTON_JUMP, 0.0));
        server.handle_input(peer_id, input(3, INPUT_BUTTON_JUMP, 0.0));
        server.tick(TICK_TIME);

        assert_eq!(server.clients[idx].as_ref().unwrap().last_processed, 3);
    }

    #[test]
    fn history_is_bounded_and_time_ordered() {
        let mut server = test_server();
        for _ in 0..(HISTORY_SIZE + 20) {
            server.time += TICK_TIME;
            server.tick(TICK_TIME);
        }

        assert_eq!(server.history.len(), HISTORY_SIZE);
        let timestamps: Vec<f32> = server.history.iter().map(|s| s.timestamp).collect();
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    /// The lag-compensation path: the shot resolves against where the
    /// target *was* at the reported shot time, while damage lands on the
    /// target's current health.
    #[test]
    fn shot_hits_historical_position() {
        let mut server = test_server();
        let (_, _s1, shooter_idx) = connect(&mut server, "shooter");
        let (_, _s2, target_idx) = connect(&mut server, "target");

        // Build a history frame at t = 1.55 with the target dead ahead.
        server.frame.players[shooter_idx].position = Vec3::new(0.0, 1.0, 0.0);
        server.frame.players[shooter_idx].yaw = 0.0;
        server.frame.players[shooter_idx].pitch = 0.0;
        server.frame.players[target_idx].position = Vec3::new(5.0, 1.0, 0.0);
        server.time = 1.55;
        server.tick(TICK_TIME);

        // By "now" the target has moved far away.
        server.frame.players[target_idx].position = Vec3::new(30.0, 1.0, 30.0);
        server.time = 1.70;

        server.lag_compensated_shot(shooter_idx as i8, 1.55);

        assert_eq!(
            server.player(target_idx).health,
            STARTING_HEALTH - BULLET_DAMAGE
        );
        assert_eq!(server.new_shots.len(), 1);
    }

    #[test]
    fn missed_shot_is_still_broadcast() {
        let mut server = test_server();
        let (_, _s1, shooter_idx) = connect(&mut server, "shooter");

        server.frame.players[shooter_idx].position = Vec3::new(0.0, 1.0, 0.0);
        server.frame.players[shooter_idx].yaw = 0.0;
        server.time = 1.0;
        server.tick(TICK_TIME);

        server.lag_compensated_shot(shooter_idx as i8, 1.0);
        assert_eq!(server.new_shots.len(), 1);
        // No history frame at the shot time falls back to the live frame.
        server.lag_compensated_shot(shooter_idx as i8, -5.0);
        assert_eq!(server.new_shots.len(), 2);
    }

    #[test]
    fn kill_queues_respawn_and_respawn_restores() {
        let mut server = test_server();
        let (_, _s1, shooter_idx) = connect(&mut server, "shooter");
        let (_, _s2, target_idx) = connect(&mut server, "target");

        server.frame.players[shooter_idx].position = Vec3::new(0.0, 1.0, 0.0);
        server.frame.players[shooter_idx].yaw = 0.0;
        server.frame.players[shooter_idx].pitch = 0.0;
        server.frame.players[target_idx].position = Vec3::new(5.0, 1.0, 0.0);
        server.frame.players[target_idx].health = BULLET_DAMAGE;
        server.time = 10.0;
        server.tick(TICK_TIME);

        server.lag_compensated_shot(shooter_idx as i8, 10.0);

        assert_eq!(server.player(target_idx).health, 0);
        assert_eq!(server.dead_players.len(), 1);
        assert_approx_eq!(
            server.dead_players[0].respawn_time,
            10.0 + RESPAWN_TIME,
            1e-5
        );

        // Not due yet.
        server.time = 11.0;
        server.update_respawns();
        assert_eq!(server.player(target_idx).health, 0);

        server.time = 11.5;
        server.update_respawns();
        assert_eq!(server.player(target_idx).health, STARTING_HEALTH);
        assert!(server.dead_players.is_empty());
        assert!(map::is_clear(&server.map, server.player(target_idx).position));
    }

    #[test]
    fn shooting_a_corpse_does_not_requeue_respawn() {
        let mut server = test_server();
        let (_, _s1, shooter_idx) = connect(&mut server, "shooter");
        let (_, _s2, target_idx) = connect(&mut server, "target");

        server.frame.players[shooter_idx].position = Vec3::new(0.0, 1.0, 0.0);
        server.frame.players[target_idx].position = Vec3::new(5.0, 1.0, 0.0);
        server.frame.players[target_idx].health = BULLET_DAMAGE;
        server.time = 10.0;
        server.tick(TICK_TIME);

        server.lag_compensated_shot(shooter_idx as i8, 10.0);
        assert_eq!(server.dead_players.len(), 1);

        server.lag_compensated_shot(shooter_idx as i8, 10.0);
        assert_eq!(server.player(target_idx).health, 0);
        assert_eq!(server.dead_players.len(), 1, "no duplicate respawn");
    }

    #[test]
    fn dead_players_do_not_process_inputs() {
        let mut server = test_server();
        let (peer_id, _socket, idx) = connect(&mut server, "alice");

        server.frame.players[idx].health = 0;
        let mut msg = input(5, 0, 0.0);
        msg.move_z = -1.0;
        server.handle_input(peer_id, msg);
        let before = server.player(idx).position;

        server.tick(TICK_TIME);
        assert_eq!(server.player(idx).position, before);
        assert_eq!(server.clients[idx].as_ref().unwrap().last_processed, 0);
    }

    #[test]
    fn snapshot_broadcast_clears_accumulated_shots() {
        let mut server = test_server();
        let (_, _s1, _) = connect(&mut server, "alice");
        let (_, _s2, _) = connect(&mut server, "bob");

        server.new_shots.push(Shot {
            shooter_idx: 0,
            ray: shared::geom::Ray {
                origin: Vec3::ZERO,
                direction: Vec3::X,
                length: 50.0,
            },
            spawn_time: 0.0,
        });

        server.broadcast_snapshot();
        assert!(server.new_shots.is_empty());
    }

    #[test]
    fn drop_client_clears_slot() {
        let mut server = test_server();
        let (peer_id, _socket, idx) = connect(&mut server, "alice");

        server.drop_client(peer_id);

        assert!(server.clients[idx].is_none());
        assert!(!server.player(idx).active());
        assert_eq!(server.player(idx).health, 0);
        assert_eq!(server.find_player_for_peer(peer_id), None);
    }
}
