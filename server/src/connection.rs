//! Per-client connection state and input buffering.

use shared::protocol::InputMessage;
use std::collections::VecDeque;

/// Inputs arrive bunched or out of order under real network conditions;
/// a short FIFO smooths that out before the tick drains it.
pub const INPUT_BUFFER_SIZE: usize = 12;

/// Server-side record of one connected client.
///
/// `last_processed` is the contract with the client's prediction: the
/// server says "this is the last input I applied, and here is your
/// position", and the client replays everything after that sequence.
pub struct ClientConnection {
    pub peer_id: u32,
    pub player_name: String,
    pub last_processed: u32,
    inputs: VecDeque<InputMessage>,
}

impl ClientConnection {
    pub fn new(peer_id: u32, player_name: String) -> Self {
        Self {
            peer_id,
            player_name,
            last_processed: 0,
            inputs: VecDeque::with_capacity(INPUT_BUFFER_SIZE),
        }
    }

    /// Buffers an input, dropping it when the FIFO is full. A dropped
    /// input is redundant: the client keeps sending newer ones.
    pub fn push_input(&mut self, input: InputMessage) -> bool {
        if self.inputs.len() >= INPUT_BUFFER_SIZE {
            return false;
        }
        self.inputs.push_back(input);
        true
    }

    pub fn pop_input(&mut self) -> Option<InputMessage> {
        self.inputs.pop_front()
    }

    pub fn pending_inputs(&self) -> usize {
        self.inputs.len()
    }
}
