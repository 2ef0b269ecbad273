use serde::{Deserialize, Serialize};

/// Capture session state machine.
///
/// State transitions:
/// ```text
/// idle → starting → capturing → stopping → idle
///          ↓            ↓
///         idle         idle      (start failure / stream fault)
/// ```
///
/// There is no terminal state; a session is reusable across start/stop cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum CaptureState {
    Idle = 0,
    Starting = 1,
    Capturing = 2,
    Stopping = 3,
}

impl CaptureState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self, Self::Capturing)
    }

    /// Whether the session currently owns an OS stream handle.
    pub fn holds_stream(&self) -> bool {
        matches!(self, Self::Starting | Self::Capturing)
    }

    /// Integer code used across the C ABI.
    pub fn as_code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Idle),
            1 => Some(Self::Starting),
            2 => Some(Self::Capturing),
            3 => Some(Self::Stopping),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Capturing => "capturing",
            Self::Stopping => "stopping",
        }
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::Idle
    }
}
