//! The narrow contract between the netcode client and whatever produces
//! inputs: a windowing shell polling a keyboard, a bot, or a test script.

/// One tick's worth of player intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputSample {
    /// Strafe axis, -1..1.
    pub move_x: f32,
    /// Forward axis, -1..1 (negative is forward).
    pub move_z: f32,
    pub yaw: f32,
    pub pitch: f32,
    /// See [`shared::INPUT_BUTTON_SHOOT`] and [`shared::INPUT_BUTTON_JUMP`].
    pub buttons: u8,
}

/// Sampled once per 60 Hz tick by the client loop.
pub trait InputSource {
    fn sample(&mut self, dt: f32) -> InputSample;
}

/// Stands still and never shoots. The default for a headless client.
#[derive(Debug, Default)]
pub struct IdleInput;

impl InputSource for IdleInput {
    fn sample(&mut self, _dt: f32) -> InputSample {
        InputSample::default()
    }
}

/// Plays back a fixed list of samples, then holds the last one. Used by
/// tests to drive deterministic movement.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    frames: Vec<InputSample>,
    cursor: usize,
}

impl ScriptedInput {
    pub fn new(frames: Vec<InputSample>) -> Self {
        Self { frames, cursor: 0 }
    }
}

impl InputSource for ScriptedInput {
    fn sample(&mut self, _dt: f32) -> InputSample {
        let sample = self
            .frames
            .get(self.cursor)
            .or_else(|| self.frames.last())
            .copied()
            .unwrap_or_default();
        if self.cursor < self.frames.len() {
            self.cursor += 1;
        }
        sample
    }
}
