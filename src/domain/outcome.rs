//! Post and rendezvous outcome types.

/// What a post asks of its queue after running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retain {
    /// Stay queued and run again at the next tick
    Keep,
    /// Leave the queue
    Drop,
}

impl Retain {
    pub fn is_keep(&self) -> bool {
        matches!(self, Retain::Keep)
    }
}

impl From<bool> for Retain {
    fn from(keep: bool) -> Self {
        if keep { Retain::Keep } else { Retain::Drop }
    }
}

/// Which side of a single-flight race ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// The primary action (or the awaited condition) won
    Action,
    /// The alternate (fallback) path won
    Alternate,
}
