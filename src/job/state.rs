//! Job FSM State Definitions
//!
//! State IDs are stable: they are what the PostgreSQL store persists.

use std::fmt;

/// Payment job states
///
/// ```text
/// SCANNING → ROUTING → [AWAITING_CONFIRMATION] → CONVERTING → BRIDGING → SETTLING → COMPLETE
///     └──────────┴──────────────┴────────────────────┴────────────┴──────────┴──▶ FAILED
///                               └──▶ EXPIRED
/// ```
///
/// Terminal states: COMPLETE (60), FAILED (-10), EXPIRED (-20)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum JobState {
    /// Reading the payer's balances
    Scanning = 0,

    /// Building the sourcing plan and quote
    Routing = 10,

    /// Plan ready, waiting for an external confirm (loop pauses here)
    AwaitingConfirmation = 20,

    /// Converting native coin into the settlement asset
    Converting = 30,

    /// Moving the settlement asset to the destination ledger
    Bridging = 40,

    /// Paying the recipient on the destination ledger
    Settling = 50,

    /// Terminal: recipient paid
    Complete = 60,

    /// Terminal: a step failed; `retry` resumes it
    Failed = -10,

    /// Terminal: never confirmed within the confirmation window
    Expired = -20,
}

impl JobState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::Failed | JobState::Expired
        )
    }

    /// The loop does not auto-advance from these
    #[inline]
    pub fn is_paused(&self) -> bool {
        *self == JobState::AwaitingConfirmation
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(JobState::Scanning),
            10 => Some(JobState::Routing),
            20 => Some(JobState::AwaitingConfirmation),
            30 => Some(JobState::Converting),
            40 => Some(JobState::Bridging),
            50 => Some(JobState::Settling),
            60 => Some(JobState::Complete),
            -10 => Some(JobState::Failed),
            -20 => Some(JobState::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scanning => "SCANNING",
            JobState::Routing => "ROUTING",
            JobState::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            JobState::Converting => "CONVERTING",
            JobState::Bridging => "BRIDGING",
            JobState::Settling => "SETTLING",
            JobState::Complete => "COMPLETE",
            JobState::Failed => "FAILED",
            JobState::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for JobState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        JobState::from_id(value).ok_or(())
    }
}
