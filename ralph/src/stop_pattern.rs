//! C6: the only regex the engine trusts with user-supplied input, wrapped
//! so a bad pattern degrades to "never matches" instead of ever reaching a
//! `panic!` or a propagated error out of the iteration loop.

use regex::Regex;
use tracing::warn;

pub const DEFAULT_STOP_PATTERN: &str = r"<promise>COMPLETE</promise>$";
pub const PLAN_READY_PATTERN: &str = r"<promise>PLAN_READY</promise>";

pub struct StopPatternDetector {
    regex: Option<Regex>,
}

impl StopPatternDetector {
    /// Never fails. A pattern that doesn't compile disables the detector
    /// (B1) rather than aborting construction — user-supplied patterns must
    /// not be able to crash the engine.
    pub fn new(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => Self { regex: Some(regex) },
            Err(error) => {
                warn!(pattern, %error, "StopPatternDetector::new: failed to compile, disabling detector");
                Self { regex: None }
            }
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.as_ref().is_some_and(|regex| regex.is_match(text))
    }

    pub fn is_enabled(&self) -> bool {
        self.regex.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_default_completion_marker() {
        let detector = StopPatternDetector::new(DEFAULT_STOP_PATTERN);
        assert!(detector.matches("All done. <promise>COMPLETE</promise>"));
        assert!(!detector.matches("Still working"));
    }

    #[test]
    fn b1_invalid_pattern_never_panics_and_always_false() {
        let detector = StopPatternDetector::new("(a");
        assert!(!detector.is_enabled());
        assert!(!detector.matches("(a"));
        assert!(!detector.matches("anything"));
    }

    #[test]
    fn plan_ready_pattern_matches_marker() {
        let detector = StopPatternDetector::new(PLAN_READY_PATTERN);
        assert!(detector.matches("Plan written. <promise>PLAN_READY</promise>"));
    }
}
