//! Value types shared by the bridge, its configuration and its callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// =============================================================================
// SIZE
// =============================================================================

/// Character-cell dimensions of a pseudo-console.
///
/// Passed at creation and on every resize. Both dimensions must be at
/// least 1; the native layer rejects zero-sized consoles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u16,
    pub height: u16,
}

impl Size {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// `true` when both dimensions are at least 1 and fit a native `COORD`.
    pub fn is_valid(&self) -> bool {
        (1..=i16::MAX as u16).contains(&self.width) && (1..=i16::MAX as u16).contains(&self.height)
    }
}

impl Default for Size {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// =============================================================================
// EXIT STATUS
// =============================================================================

/// Exit code reported by the launched child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitStatus {
    pub code: u32,
}

impl ExitStatus {
    pub const fn new(code: u32) -> Self {
        Self { code }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code {}", self.code)
    }
}

// =============================================================================
// WAIT POLICY
// =============================================================================

/// How long the bridge waits for the child process to exit.
///
/// Interactive shells want [`WaitPolicy::Infinite`]; fire-and-forget
/// commands usually want a bound so a hung child cannot pin the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    #[default]
    Infinite,
    Bounded(Duration),
}

impl WaitPolicy {
    /// Native `INFINITE` timeout value.
    pub const INFINITE_MILLIS: u32 = u32::MAX;

    /// Build a policy from a millisecond count where `0` means "forever".
    pub fn from_millis(millis: u64) -> Self {
        if millis == 0 {
            Self::Infinite
        } else {
            Self::Bounded(Duration::from_millis(millis))
        }
    }

    /// Timeout in the native millisecond form. Bounded waits are clamped
    /// below `INFINITE` so a very long bound never turns into "forever".
    pub fn as_millis_u32(&self) -> u32 {
        match self {
            Self::Infinite => Self::INFINITE_MILLIS,
            Self::Bounded(d) => d.as_millis().min(u128::from(Self::INFINITE_MILLIS - 1)) as u32,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_default_is_80x24() {
        let size = Size::default();
        assert_eq!(size.width, 80);
        assert_eq!(size.height, 24);
        assert_eq!(size.to_string(), "80x24");
    }

    #[test]
    fn size_validity() {
        assert!(Size::new(1, 1).is_valid());
        assert!(Size::new(32767, 32767).is_valid());
        assert!(!Size::new(0, 24).is_valid());
        assert!(!Size::new(80, 0).is_valid());
        assert!(!Size::new(40000, 24).is_valid());
    }

    #[test]
    fn size_partial_toml_is_rejected() {
        let parsed: Result<Size, _> = toml::from_str("width = 80");
        assert!(parsed.is_err());
        let parsed: Size = toml::from_str("width = 120\nheight = 40").unwrap();
        assert_eq!(parsed, Size::new(120, 40));
    }

    #[test]
    fn exit_status_success() {
        assert!(ExitStatus::new(0).success());
        assert!(!ExitStatus::new(3).success());
        assert_eq!(ExitStatus::new(3).to_string(), "exit code 3");
    }

    #[test]
    fn wait_policy_from_millis() {
        assert_eq!(WaitPolicy::from_millis(0), WaitPolicy::Infinite);
        assert_eq!(
            WaitPolicy::from_millis(10_000),
            WaitPolicy::Bounded(Duration::from_secs(10))
        );
    }

    #[test]
    fn wait_policy_native_millis() {
        assert_eq!(WaitPolicy::Infinite.as_millis_u32(), u32::MAX);
        assert_eq!(
            WaitPolicy::Bounded(Duration::from_secs(10)).as_millis_u32(),
            10_000
        );
        let huge = WaitPolicy::Bounded(Duration::from_secs(u64::MAX / 2));
        assert_eq!(huge.as_millis_u32(), u32::MAX - 1);
    }
}
