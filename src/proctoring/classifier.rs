//! Severity assignment for incoming violation events.
//!
//! The table is fixed; unknown kinds are logged and classified `medium`
//! rather than rejected, so a taxonomy gap never loses a violation.

use crate::models::exam_session::{ViolationKind, ViolationSeverity};

pub fn classify(kind: &ViolationKind) -> ViolationSeverity {
    match kind {
        ViolationKind::DeveloperTools => ViolationSeverity::Critical,
        ViolationKind::MultipleFaces => ViolationSeverity::High,
        ViolationKind::FaceNotDetected => ViolationSeverity::High,
        ViolationKind::SuspiciousNetwork | ViolationKind::SuspiciousRequest => {
            ViolationSeverity::High
        }
        ViolationKind::TabSwitch
        | ViolationKind::WindowBlur
        | ViolationKind::FullscreenExit
        | ViolationKind::PageVisibilityHidden
        | ViolationKind::ClipboardAccess
        | ViolationKind::KeyboardShortcut => ViolationSeverity::Medium,
        ViolationKind::RightClick => ViolationSeverity::Low,
        ViolationKind::Other(raw) => {
            tracing::warn!(kind = %raw, "unclassified violation kind, defaulting to medium");
            ViolationSeverity::Medium
        }
    }
}

/// Critical violations force a suspension regardless of the numeric score.
pub fn forces_suspension(severity: ViolationSeverity) -> bool {
    severity == ViolationSeverity::Critical
}
