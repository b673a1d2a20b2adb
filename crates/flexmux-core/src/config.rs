//! Session configuration.

use crate::DEFAULT_MAX_FRAME_PAYLOAD;

/// Which end of the connection a session is.
///
/// The two ends draw stream ids of opposite parity, so locally and remotely
/// opened streams never collide without any negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd stream ids: 1, 3, 5, ...
    Client,
    /// Opens even stream ids: 2, 4, 6, ...
    Server,
}

impl Role {
    pub fn initial_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Tunables for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// First id handed out by the allocator; later ids step by 2.
    pub initial_stream_id: u32,
    /// Bound on writes waiting behind the one in flight. `None` is unbounded.
    pub max_pending_writes: Option<usize>,
    /// Largest payload accepted for sending.
    pub max_frame_payload: usize,
}

impl SessionConfig {
    pub fn new(role: Role) -> Self {
        Self {
            initial_stream_id: role.initial_stream_id(),
            max_pending_writes: None,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
        }
    }

    /// Defaults for `role`, overridden by `FLEXMUX_MAX_PENDING_WRITES` and
    /// `FLEXMUX_MAX_FRAME_PAYLOAD` when they hold positive integers.
    pub fn from_env(role: Role) -> Self {
        let mut config = Self::new(role);
        if let Some(max) = env_usize("FLEXMUX_MAX_PENDING_WRITES") {
            config.max_pending_writes = Some(max);
        }
        if let Some(max) = env_usize("FLEXMUX_MAX_FRAME_PAYLOAD") {
            config.max_frame_payload = max;
        }
        config
    }

    pub fn with_initial_stream_id(mut self, id: u32) -> Self {
        self.initial_stream_id = id;
        self
    }

    pub fn with_max_pending_writes(mut self, max: usize) -> Self {
        self.max_pending_writes = Some(max);
        self
    }

    pub fn with_max_frame_payload(mut self, max: usize) -> Self {
        self.max_frame_payload = max;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Role::Client)
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
}
