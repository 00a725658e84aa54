//! # Device States
//!
//! The finite, declared set of device states. States form a tree: a state
//! "is derived from" each of its ancestors (`ON` is `ACTIVE` is `STATIC` is
//! `NORMAL` is `KNOWN`). `allowedStates` lists match exact names only.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{KaraboError, Result};

/// A device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum State {
    Unknown,
    Known,
    Init,
    Error,
    Normal,
    Disabled,
    Static,
    Changing,
    Running,
    Acquiring,
    Processing,
    Moving,
    Increasing,
    Decreasing,
    Active,
    Passive,
    On,
    Off,
    Started,
    Stopped,
    Opened,
    Closed,
    Interlocked,
}

const ALL_STATES: [State; 23] = [
    State::Unknown,
    State::Known,
    State::Init,
    State::Error,
    State::Normal,
    State::Disabled,
    State::Static,
    State::Changing,
    State::Running,
    State::Acquiring,
    State::Processing,
    State::Moving,
    State::Increasing,
    State::Decreasing,
    State::Active,
    State::Passive,
    State::On,
    State::Off,
    State::Started,
    State::Stopped,
    State::Opened,
    State::Closed,
    State::Interlocked,
];

impl State {
    #[must_use]
    pub fn all() -> &'static [State] {
        &ALL_STATES
    }

    /// Upper-case wire name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Known => "KNOWN",
            Self::Init => "INIT",
            Self::Error => "ERROR",
            Self::Normal => "NORMAL",
            Self::Disabled => "DISABLED",
            Self::Static => "STATIC",
            Self::Changing => "CHANGING",
            Self::Running => "RUNNING",
            Self::Acquiring => "ACQUIRING",
            Self::Processing => "PROCESSING",
            Self::Moving => "MOVING",
            Self::Increasing => "INCREASING",
            Self::Decreasing => "DECREASING",
            Self::Active => "ACTIVE",
            Self::Passive => "PASSIVE",
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
            Self::Opened => "OPENED",
            Self::Closed => "CLOSED",
            Self::Interlocked => "INTERLOCKED",
        }
    }

    /// Direct parent in the state tree.
    #[must_use]
    pub fn parent(self) -> Option<State> {
        Some(match self {
            Self::Unknown | Self::Known | Self::Init => return None,
            Self::Error | Self::Normal | Self::Disabled => Self::Known,
            Self::Static | Self::Changing | Self::Running => Self::Normal,
            Self::Acquiring | Self::Processing => Self::Running,
            Self::Moving | Self::Increasing | Self::Decreasing => Self::Changing,
            Self::Active | Self::Passive => Self::Static,
            Self::On | Self::Started | Self::Opened => Self::Active,
            Self::Off | Self::Stopped | Self::Closed => Self::Passive,
            Self::Interlocked => Self::Disabled,
        })
    }

    /// True if `self` equals `other` or descends from it.
    #[must_use]
    pub fn is_derived_from(self, other: State) -> bool {
        let mut current = Some(self);
        while let Some(state) = current {
            if state == other {
                return true;
            }
            current = state.parent();
        }
        false
    }

    /// Whether `self` is listed in `allowed` (state names).
    ///
    /// An empty list allows every state.
    #[must_use]
    pub fn is_allowed_by(self, allowed: &[String]) -> bool {
        allowed.is_empty() || allowed.iter().any(|name| name == self.name())
    }

    /// Names of several states, as stored in `allowedStates` attributes.
    #[must_use]
    pub fn names(states: &[State]) -> Vec<String> {
        states.iter().map(|s| s.name().to_string()).collect()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for State {
    type Err = KaraboError;

    fn from_str(s: &str) -> Result<Self> {
        ALL_STATES
            .iter()
            .copied()
            .find(|state| state.name() == s)
            .ok_or_else(|| KaraboError::Parse(format!("'{s}' is not a valid state")))
    }
}

impl From<State> for String {
    fn from(state: State) -> Self {
        state.name().to_string()
    }
}

impl TryFrom<String> for State {
    type Error = KaraboError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<State> for crate::Value {
    fn from(state: State) -> Self {
        crate::Value::String(state.name().to_string())
    }
}
