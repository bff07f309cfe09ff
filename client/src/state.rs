//! Client-side game state: prediction, reconciliation and snapshot intake.
//!
//! The classic poll-input / update / render loop is split across the
//! network here: the authoritative update happens on the server, so every
//! tick the client sends its input, applies it locally anyway (waiting for
//! the server's verdict would add the whole round trip to every movement),
//! and keeps the input in a history ring. When a snapshot comes back
//! carrying the last sequence the server processed, the client rewinds its
//! player to the server's state and replays everything newer — if
//! prediction and authority agree, the replayed position lands exactly
//! where the prediction already was and nothing visibly changes.

use crate::input::{InputSample, InputSource};
use crate::interp::{self, Timeline};
use crate::ClientError;
use log::{debug, info, warn};
use shared::codec;
use shared::map::{self, Map};
use shared::net::{Transport, UnknownSenderPolicy};
use shared::physics;
use shared::protocol::{
    ConnectAccept, ConnectRequest, InputMessage, MessageType, PlayerDiedMessage,
    PlayerLeftMessage, SnapshotMessage,
};
use shared::{
    Player, Shot, Snapshot, INPUT_BUTTON_SHOOT, MAX_PLAYERS, MAX_SHOTS, SNAPSHOT_COUNT,
    TICK_TIME,
};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Inputs kept for replay; at 60 Hz this covers more than a second of
/// unacknowledged movement.
const INPUT_HISTORY_SIZE: usize = 64;

/// Prediction error below this is normal quantization noise.
const CORRECTION_LOG_THRESHOLD: f32 = 0.4;

/// Give up on the server if the accept doesn't arrive within this window.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

const EVENT_LIFETIME: f32 = 3.0;
const EVENT_QUEUE_SIZE: usize = 8;
const SHOT_TRAIL_LIFETIME: f32 = 1.0;
const SHOT_TRAIL_CAP: usize = 128;

/// Feed of reliable game events for the embedding UI (kill feed etc).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GameEvent {
    Kill {
        killer_idx: i8,
        killed_idx: i8,
        time: f32,
    },
    PlayerLeft {
        player_idx: i8,
        time: f32,
    },
}

impl GameEvent {
    fn time(&self) -> f32 {
        match self {
            GameEvent::Kill { time, .. } | GameEvent::PlayerLeft { time, .. } => *time,
        }
    }
}

/// Rewinds the local player to the server-confirmed state and replays
/// every input the server has not processed yet. Fields the snapshot
/// doesn't carry survive from the pre-reconciliation player.
pub fn reconcile(
    local_player: &Player,
    server_state: &Player,
    input_history: &VecDeque<InputMessage>,
    snapshot: &Snapshot,
    map: &Map,
) -> Player {
    let predicted_position = local_player.position;

    let mut corrected = *server_state;
    let mut replayed = 0usize;

    for input in input_history {
        if input.sequence_num > server_state.last_processed_seq {
            physics::apply_input(&mut corrected, input, TICK_TIME);
            physics::apply_physics(&mut corrected, map, &snapshot.players, TICK_TIME);
            replayed += 1;
        }
    }

    let error = (predicted_position - corrected.position).length();

    corrected.on_ground = local_player.on_ground;
    corrected.wall_running = local_player.wall_running;
    corrected.wall_normal = local_player.wall_normal;
    corrected.wall_index = local_player.wall_index;

    if error >= CORRECTION_LOG_THRESHOLD {
        info!(
            "correction error {error:.3}, replayed {replayed}/{} inputs",
            input_history.len()
        );
    }

    corrected
}

pub struct ClientState {
    net: Transport,
    server_peer: u32,
    pub player_idx: i8,
    pub connected: bool,
    map: Map,
    pub timeline: Timeline,
    snapshots: VecDeque<Snapshot>,
    input_history: VecDeque<InputMessage>,
    input_sequence: u32,
    /// The locally predicted player; always drawn at this state, never
    /// interpolated.
    pub local_player: Player,
    /// Remote players interpolated for the current render time.
    pub frame: Vec<Player>,
    pub events: VecDeque<GameEvent>,
    /// Recently seen tracers, for the embedding renderer.
    pub shot_trails: VecDeque<Shot>,
}

impl ClientState {
    /// Binds `bind_port`, sends the connect request and blocks until the
    /// server accepts or the timeout passes.
    pub fn connect(
        bind_port: u16,
        server_addr: SocketAddr,
        player_name: &str,
    ) -> Result<Self, ClientError> {
        let mut net = Transport::bind(Ipv4Addr::UNSPECIFIED, bind_port)?;
        // Anything not from the server is noise.
        net.set_unknown_sender_policy(UnknownSenderPolicy::Discard);

        let Some(server_peer) = net.add_peer(server_addr) else {
            return Err(ClientError::AddPeer);
        };

        info!("connecting to {server_addr} as {player_name}");
        net.send_reliable(server_peer, &ConnectRequest::new(player_name));

        let mut state = Self {
            net,
            server_peer,
            player_idx: -1,
            connected: false,
            map: map::generate(),
            timeline: Timeline::new(),
            snapshots: VecDeque::with_capacity(SNAPSHOT_COUNT),
            input_history: VecDeque::with_capacity(INPUT_HISTORY_SIZE),
            input_sequence: 0,
            local_player: Player::default(),
            frame: Vec::new(),
            events: VecDeque::with_capacity(EVENT_QUEUE_SIZE),
            shot_trails: VecDeque::new(),
        };

        // No transport update while waiting: with no RTT measured yet the
        // retry counter would burn through its budget before a distant
        // server could answer. A lost request simply runs out the clock.
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        while !state.connected {
            if Instant::now() > deadline {
                warn!("no connect accept from server within {CONNECT_TIMEOUT:?}");
                return Err(ClientError::ConnectTimeout);
            }
            state.process_packets();
            std::thread::sleep(CONNECT_POLL_INTERVAL);
        }

        Ok(state)
    }

    /// One 60 Hz client tick: advance clocks, sample and send input,
    /// predict locally, ingest whatever the server sent, and assemble the
    /// interpolated frame.
    pub fn update(&mut self, dt: f32, source: &mut dyn InputSource) {
        if self.snapshots.len() >= 2 {
            if let Some(newest) = self.snapshots.back() {
                self.timeline.adjust_target_delay(newest.timestamp);
            }
        }
        self.timeline.advance(dt);
        self.expire_events();
        self.expire_shot_trails();
        self.timeline.server_time += dt;

        let sample = source.sample(dt);
        self.send_input(&sample);

        self.process_packets();

        // The local player is drawn at its predicted state, never from
        // interpolation.
        self.frame = interp::interpolated_frame(&self.snapshots, self.timeline.render_time);
        let local_idx = self.player_idx;
        self.frame.retain(|p| p.player_idx != local_idx);
    }

    /// Services retransmits and peer timeouts. Returns `false` once the
    /// transport has given up on the server.
    pub fn net_update(&mut self, dt: f32) -> bool {
        let removed = self.net.update(dt);
        !removed.contains(&self.server_peer)
    }

    fn next_sequence(&mut self) -> u32 {
        self.input_sequence += 1;
        self.input_sequence
    }

    /// Sends one input unreliably and immediately applies it to the local
    /// player. Batching several frames per packet would cut header
    /// overhead, but then losing one packet loses several inputs at once.
    fn send_input(&mut self, sample: &InputSample) {
        if !self.connected {
            return;
        }

        let shooting = sample.buttons & INPUT_BUTTON_SHOOT != 0;
        let msg = InputMessage {
            sequence_num: self.next_sequence(),
            move_x: sample.move_x,
            move_z: sample.move_z,
            look_yaw: sample.yaw,
            look_pitch: sample.pitch,
            buttons: sample.buttons,
            shot_time: if shooting {
                self.timeline.server_time
            } else {
                0.0
            },
            time: self.timeline.render_time,
        };

        self.net.send_unreliable(self.server_peer, &msg);

        if self.input_history.len() == INPUT_HISTORY_SIZE {
            self.input_history.pop_front();
        }
        self.input_history.push_back(msg);

        // Prediction: the same shared functions the server will run.
        let others = self
            .snapshots
            .back()
            .map(|snapshot| snapshot.players)
            .unwrap_or([Player::default(); MAX_PLAYERS]);
        physics::apply_input(&mut self.local_player, &msg, TICK_TIME);
        physics::apply_physics(&mut self.local_player, &self.map, &others, TICK_TIME);
    }

    pub fn process_packets(&mut self) {
        while let Some(polled) = self.net.poll() {
            match MessageType::from_u8(polled.msg_type) {
                Some(MessageType::ServerSnapshot) => {
                    match shared::protocol::decode::<SnapshotMessage>(self.net.payload(&polled)) {
                        Ok(msg) => self.handle_snapshot(&msg),
                        Err(e) => debug!("bad snapshot: {e}"),
                    }
                }
                Some(MessageType::ConnectAccept) => {
                    match shared::protocol::decode::<ConnectAccept>(self.net.payload(&polled)) {
                        Ok(msg) => self.handle_connect_accept(&msg),
                        Err(e) => debug!("bad connect accept: {e}"),
                    }
                }
                Some(MessageType::PlayerDied) => {
                    match shared::protocol::decode::<PlayerDiedMessage>(self.net.payload(&polled))
                    {
                        Ok(msg) => self.handle_player_died(&msg),
                        Err(e) => debug!("bad death event: {e}"),
                    }
                }
                Some(MessageType::PlayerLeft) => {
                    match shared::protocol::decode::<PlayerLeftMessage>(self.net.payload(&polled))
                    {
                        Ok(msg) => self.handle_player_left(&msg),
                        Err(e) => debug!("bad leave event: {e}"),
                    }
                }
                _ => debug!("unhandled message type {}", polled.msg_type),
            }
            self.net.release(&polled);
        }
    }

    fn handle_connect_accept(&mut self, msg: &ConnectAccept) {
        if self.connected {
            return;
        }
        self.player_idx = msg.player_index;
        self.timeline.start(msg.server_time);
        self.connected = true;
        info!("connected, player index {}", self.player_idx);
    }

    fn handle_snapshot(&mut self, msg: &SnapshotMessage) {
        self.timeline.sync_to_snapshot(msg.server_time);

        let mut snapshot = Snapshot {
            timestamp: msg.server_time,
            ..Snapshot::default()
        };
        for q in &msg.players[..(msg.player_count as usize).min(MAX_PLAYERS)] {
            let player = codec::dequantize_player(q);
            if (0..MAX_PLAYERS as i8).contains(&player.player_idx) {
                snapshot.players[player.player_idx as usize] = player;
            }
        }

        if self.snapshots.len() == SNAPSHOT_COUNT {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);

        if let Some(server_local) = snapshot.player(self.player_idx).copied() {
            self.local_player = reconcile(
                &self.local_player,
                &server_local,
                &self.input_history,
                &snapshot,
                &self.map,
            );
        }

        for q in &msg.shots[..(msg.shot_count as usize).min(MAX_SHOTS)] {
            let mut shot = codec::dequantize_shot(q);
            shot.spawn_time = self.timeline.server_time;
            if self.shot_trails.len() == SHOT_TRAIL_CAP {
                self.shot_trails.pop_front();
            }
            self.shot_trails.push_back(shot);
        }
    }

    fn handle_player_died(&mut self, msg: &PlayerDiedMessage) {
        info!("player {} killed player {}", msg.killer_idx, msg.killed_idx);
        self.push_event(GameEvent::Kill {
            killer_idx: msg.killer_idx,
            killed_idx: msg.killed_idx,
            time: self.timeline.server_time,
        });
    }

    fn handle_player_left(&mut self, msg: &PlayerLeftMessage) {
        info!("player {} left", msg.player_idx);
        self.push_event(GameEvent::PlayerLeft {
            player_idx: msg.player_idx,
            time: self.timeline.server_time,
        });
    }

    fn push_event(&mut self, event: GameEvent) {
        if self.events.len() == EVENT_QUEUE_SIZE {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn expire_events(&mut self) {
        let now = self.timeline.server_time;
        while let Some(oldest) = self.events.front() {
            if now - oldest.time() <= EVENT_LIFETIME {
                break;
            }
            self.events.pop_front();
        }
    }

    fn expire_shot_trails(&mut self) {
        let now = self.timeline.server_time;
        while let Some(oldest) = self.shot_trails.front() {
            if now - oldest.spawn_time <= SHOT_TRAIL_LIFETIME {
                break;
            }
            self.shot_trails.pop_front();
        }
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::INPUT_BUTTON_JUMP;

    fn input(seq: u32, move_z: f32, buttons: u8) -> InputMessage {
        InputMessage {
            sequence_num: seq,
            move_z,
            buttons,
            ..Default::default()
        }
    }

    fn spawn_player(idx: i8) -> Player {
        Player {
            player_idx: idx,
            position: glam::Vec3::new(0.0, 1.0, 0.0),
            health: 100,
            on_ground: true,
            jumps_remaining: 2,
            ..Player::default()
        }
    }

    /// The heart of prediction: the server confirms part of the input
    /// stream, the replay of the remainder lands exactly where the
    /// client's own prediction already was.
    #[test]
    fn replay_reproduces_prediction() {
        let map = map::generate();
        let inputs: Vec<InputMessage> = (10..=15)
            .map(|seq| {
                input(
                    seq,
                    -1.0,
                    if seq == 13 { INPUT_BUTTON_JUMP } else { 0 },
                )
            })
            .collect();

        // Client-side prediction: everything applied as it was sent.
        let empty_others = Snapshot::default();
        let mut predicted = spawn_player(0);
        for msg in &inputs {
            physics::apply_input(&mut predicted, msg, TICK_TIME);
            physics::apply_physics(&mut predicted, &map, &empty_others.players, TICK_TIME);
        }

        // Server authority: only sequences 10..=12 processed so far.
        let mut server_side = spawn_player(0);
        for msg in &inputs[..3] {
            physics::apply_input(&mut server_side, msg, TICK_TIME);
            physics::apply_physics(&mut server_side, &map, &empty_others.players, TICK_TIME);
        }
        server_side.last_processed_seq = 12;

        let history: VecDeque<InputMessage> = inputs.clone().into();
        let corrected = reconcile(&predicted, &server_side, &history, &empty_others, &map);

        assert_eq!(
            corrected.position.to_array(),
            predicted.position.to_array(),
            "replayed path must match the predicted one exactly"
        );
        assert_eq!(corrected.velocity.to_array(), predicted.velocity.to_array());
    }

    #[test]
    fn reconcile_adopts_server_position_when_history_is_consumed() {
        let map = map::generate();
        let predicted = spawn_player(0);

        let mut server_side = spawn_player(0);
        server_side.position = glam::Vec3::new(3.0, 1.0, 4.0);
        server_side.last_processed_seq = 20;

        // Every held input is already acknowledged: nothing to replay.
        let history: VecDeque<InputMessage> =
            (15..=20).map(|seq| input(seq, -1.0, 0)).collect();
        let snapshot = Snapshot::default();

        let corrected = reconcile(&predicted, &server_side, &history, &snapshot, &map);
        assert_eq!(corrected.position, server_side.position);
    }

    #[test]
    fn reconcile_preserves_untransmitted_fields() {
        let map = map::generate();
        let mut local = spawn_player(0);
        local.wall_running = true;
        local.wall_normal = glam::Vec3::X;
        local.wall_index = 7;
        local.on_ground = false;

        let mut server_side = spawn_player(0);
        // The codec zeroes these before the snapshot reaches us.
        server_side.wall_running = false;
        server_side.wall_index = -1;
        server_side.last_processed_seq = 5;

        let history = VecDeque::new();
        let snapshot = Snapshot::default();
        let corrected = reconcile(&local, &server_side, &history, &snapshot, &map);

        assert!(corrected.wall_running);
        assert_eq!(corrected.wall_normal, glam::Vec3::X);
        assert_eq!(corrected.wall_index, 7);
        assert!(!corrected.on_ground);
    }

    #[test]
    fn event_queue_is_bounded_and_expires() {
        let server_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 1));
        // Building a full ClientState needs a socket but no server.
        let mut net = Transport::bind(Ipv4Addr::LOCALHOST, 0).unwrap();
        let server_peer = net.add_peer(server_addr).unwrap();
        let mut state = ClientState {
            net,
            server_peer,
            player_idx: 0,
            connected: true,
            map: map::generate(),
            timeline: Timeline::new(),
            snapshots: VecDeque::new(),
            input_history: VecDeque::new(),
            input_sequence: 0,
            local_player: Player::default(),
            frame: Vec::new(),
            events: VecDeque::new(),
            shot_trails: VecDeque::new(),
        };

        for i in 0..12 {
            state.push_event(GameEvent::PlayerLeft {
                player_idx: i as i8 % 8,
                time: 0.0,
            });
        }
        assert_eq!(state.events.len(), EVENT_QUEUE_SIZE);

        state.timeline.server_time = EVENT_LIFETIME + 1.0;
        state.expire_events();
        assert!(state.events.is_empty());
    }

    #[test]
    fn input_sequence_is_monotonic_from_one() {
        let mut net = Transport::bind(Ipv4Addr::LOCALHOST, 0).unwrap();
        let server_peer = net
            .add_peer(SocketAddr::from((Ipv4Addr::LOCALHOST, 1)))
            .unwrap();
        let mut state = ClientState {
            net,
            server_peer,
            player_idx: 0,
            connected: true,
            map: map::generate(),
            timeline: Timeline::new(),
            snapshots: VecDeque::new(),
            input_history: VecDeque::new(),
            input_sequence: 0,
            local_player: spawn_player(0),
            frame: Vec::new(),
            events: VecDeque::new(),
            shot_trails: VecDeque::new(),
        };

        for _ in 0..(INPUT_HISTORY_SIZE + 10) {
            state.send_input(&InputSample::default());
        }

        let seqs: Vec<u32> = state.input_history.iter().map(|i| i.sequence_num).collect();
        assert_eq!(seqs.len(), INPUT_HISTORY_SIZE);
        assert_eq!(*seqs.first().unwrap(), 11);
        assert_eq!(*seqs.last().unwrap(), (INPUT_HISTORY_SIZE + 10) as u32);
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    }
}
