//! Risk scoring for a proctored session.
//!
//! Pure and deterministic so it can be unit-tested without a store. Each
//! category contributes a weighted, independently capped amount; the caps
//! keep any single signal from dominating the aggregate.

use crate::models::exam_session::ProctoringCounters;

const TAB_SWITCH_WEIGHT: u64 = 10;
const TAB_SWITCH_CAP: u64 = 30;
const WINDOW_BLUR_WEIGHT: u64 = 5;
const WINDOW_BLUR_CAP: u64 = 25;
const WEBCAM_INTERRUPTION_WEIGHT: u64 = 15;
const WEBCAM_INTERRUPTION_CAP: u64 = 40;
const SUSPICIOUS_REQUEST_WEIGHT: u64 = 20;
const SUSPICIOUS_REQUEST_CAP: u64 = 35;
const DEVELOPER_TOOLS_WEIGHT: u64 = 25;
const DEVELOPER_TOOLS_CAP: u64 = 50;
const VIOLATION_WEIGHT: u64 = 5;
const VIOLATION_CAP: u64 = 20;
const IP_CHANGE_WEIGHT: u64 = 15;
const IP_CHANGE_CAP: u64 = 30;
const NO_LOCKDOWN_PENALTY: u64 = 30;

pub const MAX_RISK_SCORE: u8 = 100;

fn capped(count: u64, weight: u64, cap: u64) -> u64 {
    count.saturating_mul(weight).min(cap)
}

/// Maps accumulated counters and violation history to a 0-100 score.
pub fn risk_score(
    counters: &ProctoringCounters,
    violation_count: usize,
    ip_change_count: usize,
) -> u8 {
    let mut score: u64 = 0;

    score += capped(
        counters.tab_switch_attempts as u64,
        TAB_SWITCH_WEIGHT,
        TAB_SWITCH_CAP,
    );
    score += capped(
        counters.window_blur_events as u64,
        WINDOW_BLUR_WEIGHT,
        WINDOW_BLUR_CAP,
    );
    score += capped(
        counters.webcam_interruptions as u64,
        WEBCAM_INTERRUPTION_WEIGHT,
        WEBCAM_INTERRUPTION_CAP,
    );
    score += capped(
        counters.suspicious_requests_blocked as u64,
        SUSPICIOUS_REQUEST_WEIGHT,
        SUSPICIOUS_REQUEST_CAP,
    );
    score += capped(
        counters.developer_tools_attempts as u64,
        DEVELOPER_TOOLS_WEIGHT,
        DEVELOPER_TOOLS_CAP,
    );
    score += capped(violation_count as u64, VIOLATION_WEIGHT, VIOLATION_CAP);
    score += capped(ip_change_count as u64, IP_CHANGE_WEIGHT, IP_CHANGE_CAP);

    if !counters.is_lockdown_browser && !counters.is_remote_monitor {
        score += NO_LOCKDOWN_PENALTY;
    }

    score.min(MAX_RISK_SCORE as u64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lockdown_counters() -> ProctoringCounters {
        ProctoringCounters {
            is_lockdown_browser: true,
            ..Default::default()
        }
    }

    #[test]
    fn clean_lockdown_session_scores_zero() {
        assert_eq!(risk_score(&lockdown_counters(), 0, 0), 0);
    }

    #[test]
    fn missing_lockdown_browser_adds_flat_penalty() {
        let counters = ProctoringCounters::default();
        assert_eq!(risk_score(&counters, 0, 0), 30);

        let remote = ProctoringCounters {
            is_remote_monitor: true,
            ..Default::default()
        };
        assert_eq!(risk_score(&remote, 0, 0), 0);
    }

    #[test]
    fn tab_switches_cap_at_thirty() {
        let mut counters = lockdown_counters();
        counters.tab_switch_attempts = 4;
        assert_eq!(risk_score(&counters, 0, 0), 30);

        counters.tab_switch_attempts = 100;
        assert_eq!(risk_score(&counters, 0, 0), 30);
    }

    #[test]
    fn each_category_is_capped_independently() {
        let mut counters = lockdown_counters();
        counters.window_blur_events = 1000;
        counters.webcam_interruptions = 1000;
        counters.suspicious_requests_blocked = 1000;
        counters.developer_tools_attempts = 1000;
        // 25 + 40 + 35 + 50 would be 150 without the overall clamp.
        assert_eq!(risk_score(&counters, 0, 0), 100);
    }

    #[test]
    fn violation_log_length_contributes_up_to_twenty() {
        let counters = lockdown_counters();
        assert_eq!(risk_score(&counters, 2, 0), 10);
        assert_eq!(risk_score(&counters, 50, 0), 20);
    }

    #[test]
    fn ip_changes_contribute_up_to_thirty() {
        let counters = lockdown_counters();
        assert_eq!(risk_score(&counters, 0, 1), 15);
        assert_eq!(risk_score(&counters, 0, 5), 30);
    }

    #[test]
    fn score_never_exceeds_one_hundred() {
        let counters = ProctoringCounters {
            tab_switch_attempts: u32::MAX,
            window_blur_events: u32::MAX,
            webcam_interruptions: u32::MAX,
            suspicious_requests_blocked: u32::MAX,
            developer_tools_attempts: u32::MAX,
            ..Default::default()
        };
        assert_eq!(risk_score(&counters, usize::MAX, usize::MAX), 100);
    }

    #[test]
    fn score_is_monotone_in_counters() {
        let mut counters = lockdown_counters();
        let mut previous = risk_score(&counters, 0, 0);
        for n in 1..20 {
            counters.tab_switch_attempts = n;
            counters.window_blur_events = n;
            let next = risk_score(&counters, n as usize, 0);
            assert!(next >= previous);
            previous = next;
        }
    }
}
