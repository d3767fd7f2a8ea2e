use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical position of a message within a stream.
///
/// Positions are dense: the first message of a stream sits at `START` and
/// every append claims the following integer, so a position doubles as the
/// count of messages before it. The arithmetic surface is kept narrow so
/// callers derive positions from the log rather than fabricating them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(u64);

impl Offset {
    /// Position of the first message ever appended to a stream.
    pub const START: Offset = Offset(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Offset(value)
    }

    /// Numeric value, for arithmetic against log-end counters.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The position one append later.
    #[inline]
    pub fn successor(self) -> Self {
        Offset(self.0 + 1)
    }

    /// The position one message earlier, unless already at the start.
    #[inline]
    pub fn predecessor(self) -> Option<Self> {
        self.0.checked_sub(1).map(Offset)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Offset(value)
    }
}

impl From<Offset> for u64 {
    fn from(offset: Offset) -> Self {
        offset.0
    }
}
