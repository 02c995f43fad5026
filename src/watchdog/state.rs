use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Alive -> Gone
    Lost,
    /// Gone -> Alive
    Recovered,
}

/// Per-server liveness; no terminal state while the watch runs.
#[derive(Debug)]
pub struct LivenessMachine {
    pub state: Liveness,
}

impl LivenessMachine {
    pub fn new(running: bool) -> Self {
        let state = if running { Liveness::Alive } else { Liveness::Gone };
        Self { state }
    }

    pub fn is_alive(&self) -> bool {
        self.state == Liveness::Alive
    }

    /// Feeds one probe result, returning the transition it caused.
    pub fn observe(&mut self, running: bool) -> Option<Transition> {
        let transition = match (self.state, running) {
            (Liveness::Alive, false) => Transition::Lost,
            (Liveness::Gone, true) => Transition::Recovered,
            _ => return None,
        };
        let to = if running { Liveness::Alive } else { Liveness::Gone };
        tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
        self.state = to;
        Some(transition)
    }

    /// 살아있는 동안은 짧게, 내려간 동안은 길게 폴링
    pub fn poll_interval(&self, alive: Duration, gone: Duration) -> Duration {
        match self.state {
            Liveness::Alive => alive,
            Liveness::Gone => gone,
        }
    }
}
