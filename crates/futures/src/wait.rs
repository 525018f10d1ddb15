//! Blocking-duration semantics shared by queue claims and result waits

use std::time::Duration;

use tokio::time::Instant;

/// How long a claim or a result wait may block.
///
/// `Wait::For(Duration::ZERO)` checks once and returns immediately,
/// `Wait::Forever` blocks until something shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Block without a deadline
    Forever,
    /// Block for at most this long
    For(Duration),
}

impl Wait {
    /// Check once, never block
    pub const IMMEDIATE: Wait = Wait::For(Duration::ZERO);

    /// Interpret a signed number of seconds: negative means forever,
    /// zero means immediate.
    pub fn from_secs(secs: i64) -> Self {
        if secs < 0 {
            Wait::Forever
        } else {
            Wait::For(Duration::from_secs(secs as u64))
        }
    }

    /// Whether this wait never blocks
    pub fn is_immediate(&self) -> bool {
        matches!(self, Wait::For(d) if d.is_zero())
    }

    /// Deadline relative to now, `None` when waiting forever.
    ///
    /// A duration too large to be represented as an instant also yields
    /// `None`.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Wait::Forever => None,
            Wait::For(d) => Instant::now().checked_add(*d),
        }
    }

    /// Cap the wait at `slice`; used to keep long waits interruptible
    pub fn capped(&self, slice: Duration) -> Wait {
        match self {
            Wait::Forever => Wait::For(slice),
            Wait::For(d) => Wait::For((*d).min(slice)),
        }
    }
}

impl Default for Wait {
    fn default() -> Self {
        Wait::IMMEDIATE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_secs() {
        assert_eq!(Wait::from_secs(-1), Wait::Forever);
        assert_eq!(Wait::from_secs(0), Wait::IMMEDIATE);
        assert_eq!(Wait::from_secs(5), Wait::For(Duration::from_secs(5)));
    }

    #[test]
    fn test_is_immediate() {
        assert!(Wait::IMMEDIATE.is_immediate());
        assert!(!Wait::Forever.is_immediate());
        assert!(!Wait::For(Duration::from_millis(1)).is_immediate());
    }

    #[test]
    fn test_capped() {
        let slice = Duration::from_secs(1);
        assert_eq!(Wait::Forever.capped(slice), Wait::For(slice));
        assert_eq!(
            Wait::For(Duration::from_millis(10)).capped(slice),
            Wait::For(Duration::from_millis(10))
        );
        assert_eq!(Wait::For(Duration::from_secs(30)).capped(slice), Wait::For(slice));
    }

    #[tokio::test]
    async fn test_deadline() {
        assert!(Wait::Forever.deadline().is_none());
        let deadline = Wait::IMMEDIATE.deadline().unwrap();
        assert!(deadline <= Instant::now());
    }

    #[tokio::test]
    async fn test_unrepresentable_deadline_is_forever() {
        assert!(Wait::For(Duration::MAX).deadline().is_none());
        assert!(Wait::from_secs(i64::MAX).deadline().is_none());
        assert!(Wait::For(Duration::from_secs(60)).deadline().is_some());
    }
}
