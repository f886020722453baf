use serde::Serialize;

/// Lifecycle of a collection run.
///
/// ```text
/// idle ──start──▶ running ──pause──▶ paused
///   ▲               ▲  │               │
///   │               │  └────resume─────┘
///   │               │
///   └── stopped ◀───┴──stop── (any)
/// ```
///
/// Only `Running` lets events through to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl RunState {
    pub fn accepts_events(self) -> bool {
        self == Self::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Move { from: RunState, to: RunState },
    /// The command does not apply in this state. Not an error.
    Stay(RunState),
}

/// Pure transition table. Side effects are the controller's job.
pub fn apply(state: RunState, command: Command) -> Transition {
    use RunState::*;

    let to = match (state, command) {
        (Idle | Stopped, Command::Start) => Running,
        (Running, Command::Pause) => Paused,
        (Paused, Command::Resume) => Running,
        (Idle | Running | Paused, Command::Stop) => Stopped,
        _ => return Transition::Stay(state),
    };
    Transition::Move { from: state, to }
}
