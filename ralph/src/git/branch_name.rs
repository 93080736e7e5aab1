//! Branch-name generation (§6, P8). Kept as free functions rather than
//! methods on `GitService` since they're pure and the state machine's
//! `start` step needs to call `sanitize` before any git process exists.

use chrono::{DateTime, Utc};

const MAX_NAME_LEN: usize = 40;

/// Idempotent: `sanitize(sanitize(x)) == sanitize(x)`. Always returns
/// `[a-z0-9-]{1,40}`, never starts/ends with `-`; empty-after-sanitise
/// input becomes `"unnamed"`.
pub fn sanitize(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut mapped: String = lowered.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' }).collect();

    // collapse runs of '-'
    let mut collapsed = String::with_capacity(mapped.len());
    let mut prev_dash = false;
    for c in mapped.drain(..) {
        if c == '-' {
            if !prev_dash {
                collapsed.push(c);
            }
            prev_dash = true;
        } else {
            collapsed.push(c);
            prev_dash = false;
        }
    }

    let trimmed = collapsed.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    let truncated = truncated.trim_end_matches('-');

    if truncated.is_empty() {
        "unnamed".to_string()
    } else {
        truncated.to_string()
    }
}

/// `<prefix><sanitize(name)>-<YYYY-MM-DD-HH-MM-SS>`.
pub fn generate_branch_name(prefix: &str, name: &str, started_at: DateTime<Utc>) -> String {
    format!("{prefix}{}-{}", sanitize(name), started_at.format("%Y-%m-%d-%H-%M-%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lowercases_and_maps_invalid_chars() {
        assert_eq!(sanitize("Fix The Bug!!"), "fix-the-bug");
    }

    #[test]
    fn collapses_runs_of_hyphens() {
        assert_eq!(sanitize("a---b"), "a-b");
    }

    #[test]
    fn trims_leading_and_trailing_hyphens() {
        assert_eq!(sanitize("--hello--"), "hello");
    }

    #[test]
    fn empty_input_becomes_unnamed() {
        assert_eq!(sanitize(""), "unnamed");
        assert_eq!(sanitize("!!!"), "unnamed");
    }

    #[test]
    fn truncates_to_forty_and_trims_boundary_hyphen() {
        let long = "a".repeat(39) + "-" + &"b".repeat(10);
        let sanitized = sanitize(&long);
        assert!(sanitized.len() <= MAX_NAME_LEN);
        assert!(!sanitized.ends_with('-'));
    }

    #[test]
    fn generate_branch_name_matches_contract() {
        let ts = DateTime::parse_from_rfc3339("2026-07-27T10:30:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(generate_branch_name("ralph/", "Fix The Bug", ts), "ralph/fix-the-bug-2026-07-27-10-30-00");
    }

    proptest! {
        #[test]
        fn p8_sanitize_is_idempotent(s in "\\PC*") {
            let once = sanitize(&s);
            let twice = sanitize(&once);
            prop_assert_eq!(&once, &twice);
        }

        #[test]
        fn p8_sanitize_output_shape(s in "\\PC*") {
            let out = sanitize(&s);
            prop_assert!(!out.is_empty() && out.len() <= MAX_NAME_LEN);
            prop_assert!(out.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            prop_assert!(!out.starts_with('-') && !out.ends_with('-'));
        }
    }
}
