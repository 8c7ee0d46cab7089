//! Integration tests for backup run and restore-mode state rules.
//!
//! These tests verify the business rules independent of any live
//! database or client:
//! - Backup run status transitions (pending -> running -> success/failed)
//! - Restore mode escalation (incremental < overwrite < complete)
//! - Missed-backup scheduling windows per kind

// ============================================================================
// Backup Run Status Transition Tests
// ============================================================================

const VALID_STATUSES: &[&str] = &["pending", "running", "success", "failed"];

mod status_transitions {
    use super::*;

    /// Check if a backup run status transition is valid.
    fn is_valid_transition(from: &str, to: &str) -> bool {
        match (from, to) {
            ("pending", "running") => true,
            ("running", "success") => true,
            ("running", "failed") => true,
            // A restart mid-run recovers stale runs to failed directly.
            ("pending", "failed") => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }

    #[test]
    fn test_happy_path() {
        assert!(is_valid_transition("pending", "running"));
        assert!(is_valid_transition("running", "success"));
    }

    #[test]
    fn test_failure_path() {
        assert!(is_valid_transition("running", "failed"));
        assert!(is_valid_transition("pending", "failed"));
    }

    #[test]
    fn test_terminal_statuses_do_not_advance() {
        for terminal in ["success", "failed"] {
            assert!(!is_valid_transition(terminal, "running"));
            assert!(!is_valid_transition(terminal, "pending"));
        }
    }

    #[test]
    fn test_no_skipping_running() {
        assert!(!is_valid_transition("pending", "success"));
    }

    #[test]
    fn test_same_status_is_a_noop() {
        for status in VALID_STATUSES {
            assert!(is_valid_transition(status, status));
        }
    }
}

// ============================================================================
// Restore Mode Escalation Tests
// ============================================================================

mod restore_mode_escalation {
    /// Mirrors `RestoreMode::allows_update`/`allows_delete` without pulling
    /// in the crate: incremental only adds, overwrite adds+updates,
    /// complete adds+updates+deletes.
    fn allows_update(mode: &str) -> bool {
        matches!(mode, "overwrite" | "complete")
    }

    fn allows_delete(mode: &str) -> bool {
        mode == "complete"
    }

    #[test]
    fn incremental_never_updates_or_deletes() {
        assert!(!allows_update("incremental"));
        assert!(!allows_delete("incremental"));
    }

    #[test]
    fn overwrite_updates_but_never_deletes() {
        assert!(allows_update("overwrite"));
        assert!(!allows_delete("overwrite"));
    }

    #[test]
    fn complete_updates_and_deletes() {
        assert!(allows_update("complete"));
        assert!(allows_delete("complete"));
    }

    #[test]
    fn parse_rule_trims_lowercases_and_defaults_empty_to_incremental() {
        fn parse(input: &str) -> Result<&'static str, String> {
            match input.trim().to_lowercase().as_str() {
                "" | "incremental" => Ok("incremental"),
                "overwrite" => Ok("overwrite"),
                "complete" => Ok("complete"),
                other => Err(format!("invalid restore mode: {other}")),
            }
        }

        assert_eq!(parse(" overwrite ").unwrap(), "overwrite");
        assert_eq!(parse("").unwrap(), "incremental");
        assert!(parse("invalid").is_err());
    }
}

// ============================================================================
// Missed Backup Window Tests
// ============================================================================

mod missed_backup_windows {
    use chrono::{Duration, Months, Utc};

    fn is_missed(kind: &str, last_success: Option<chrono::DateTime<Utc>>, now: chrono::DateTime<Utc>) -> bool {
        if kind == "manual" {
            return false;
        }
        let Some(last) = last_success else {
            return true;
        };
        match kind {
            "hourly" => now - last >= Duration::hours(1),
            "daily" => now - last >= Duration::days(1),
            "weekly" => now - last >= Duration::days(7),
            "monthly" => last.checked_add_months(Months::new(1)).map(|next| now >= next).unwrap_or(false),
            _ => false,
        }
    }

    #[test]
    fn never_run_before_is_always_missed_for_scheduled_kinds() {
        assert!(is_missed("hourly", None, Utc::now()));
        assert!(is_missed("daily", None, Utc::now()));
    }

    #[test]
    fn manual_is_never_missed() {
        assert!(!is_missed("manual", None, Utc::now()));
    }

    #[test]
    fn hourly_is_missed_after_an_hour() {
        let now = Utc::now();
        let last = now - Duration::minutes(61);
        assert!(is_missed("hourly", Some(last), now));
        let last_recent = now - Duration::minutes(30);
        assert!(!is_missed("hourly", Some(last_recent), now));
    }

    #[test]
    fn monthly_is_calendar_aware_not_a_fixed_thirty_days() {
        // Jan 31 + 1 calendar month lands on Feb 28 (non-leap), not Mar 2.
        let jan31 = chrono::DateTime::parse_from_rfc3339("2025-01-31T00:00:00Z").unwrap().with_timezone(&Utc);
        let feb27 = chrono::DateTime::parse_from_rfc3339("2025-02-27T00:00:00Z").unwrap().with_timezone(&Utc);
        let mar01 = chrono::DateTime::parse_from_rfc3339("2025-03-01T00:00:00Z").unwrap().with_timezone(&Utc);
        assert!(!is_missed("monthly", Some(jan31), feb27));
        assert!(is_missed("monthly", Some(jan31), mar01));
    }
}
