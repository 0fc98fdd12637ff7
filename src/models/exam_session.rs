use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExamType {
    Jamb,
    Waec,
}

impl ExamType {
    pub fn exam_id_prefix(&self) -> char {
        match self {
            ExamType::Jamb => 'J',
            ExamType::Waec => 'W',
        }
    }

    pub fn from_exam_id_prefix(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'J' => Some(ExamType::Jamb),
            'W' => Some(ExamType::Waec),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExamType::Jamb => write!(f, "JAMB"),
            ExamType::Waec => write!(f, "WAEC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Suspended,
    Terminated,
    Completed,
}

impl SessionStatus {
    /// Terminated and completed sessions accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Completed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TabSwitch,
    WindowBlur,
    FaceNotDetected,
    MultipleFaces,
    SuspiciousNetwork,
    ClipboardAccess,
    FullscreenExit,
    PageVisibilityHidden,
    SuspiciousRequest,
    KeyboardShortcut,
    RightClick,
    DeveloperTools,
    /// Forward-compatible catch-all: unknown kinds are kept verbatim so a
    /// violation is never dropped for classification failure.
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationKind::TabSwitch => write!(f, "tab_switch"),
            ViolationKind::WindowBlur => write!(f, "window_blur"),
            ViolationKind::FaceNotDetected => write!(f, "face_not_detected"),
            ViolationKind::MultipleFaces => write!(f, "multiple_faces"),
            ViolationKind::SuspiciousNetwork => write!(f, "suspicious_network"),
            ViolationKind::ClipboardAccess => write!(f, "clipboard_access"),
            ViolationKind::FullscreenExit => write!(f, "fullscreen_exit"),
            ViolationKind::PageVisibilityHidden => write!(f, "page_visibility_hidden"),
            ViolationKind::SuspiciousRequest => write!(f, "suspicious_request"),
            ViolationKind::KeyboardShortcut => write!(f, "keyboard_shortcut"),
            ViolationKind::RightClick => write!(f, "right_click"),
            ViolationKind::DeveloperTools => write!(f, "developer_tools"),
            ViolationKind::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationSeverity::Low => "low",
            ViolationSeverity::Medium => "medium",
            ViolationSeverity::High => "high",
            ViolationSeverity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Structured payload attached to a violation, keyed by what produced it.
/// Anything the service does not recognize round-trips through `Raw`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationDetails {
    Webcam {
        confidence: f64,
        face_count: Option<u32>,
    },
    IpChange {
        old_ip: String,
        new_ip: String,
    },
    #[serde(untagged)]
    Raw(JsonValue),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: ViolationSeverity,
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: Option<ViolationDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpChange {
    pub old_ip: String,
    pub new_ip: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub is_lockdown_browser: bool,
    #[serde(default)]
    pub is_remote_monitor: bool,
    #[serde(default)]
    pub is_fullscreen_mode: bool,
    #[serde(default)]
    pub webcam_requested: bool,
}

/// Accumulated proctoring signals for one session. All counters only ever
/// increase; the risk scorer derives its contributions from them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProctoringCounters {
    // Browser environment
    pub browser_name: Option<String>,
    pub browser_version: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub is_lockdown_browser: bool,
    #[serde(default)]
    pub is_remote_monitor: bool,
    #[serde(default)]
    pub is_fullscreen_mode: bool,

    // Webcam monitoring
    #[serde(default)]
    pub webcam_enabled: bool,
    #[serde(default)]
    pub face_detection_frames_analyzed: u64,
    #[serde(default)]
    pub face_detection_accuracy: f64,
    #[serde(default)]
    pub webcam_interruptions: u32,
    #[serde(default)]
    pub average_confidence: f64,

    // Tab/window monitoring
    #[serde(default)]
    pub tab_switch_attempts: u32,
    #[serde(default)]
    pub window_blur_events: u32,
    #[serde(default)]
    pub fullscreen_exit_attempts: u32,
    #[serde(default)]
    pub page_visibility_hidden_events: u32,

    // Network monitoring
    #[serde(default)]
    pub suspicious_requests_blocked: u32,
    #[serde(default)]
    pub external_domain_access_attempts: u32,

    // Keyboard monitoring
    #[serde(default)]
    pub keyboard_shortcut_attempts: u32,
    #[serde(default)]
    pub right_click_attempts: u32,
    #[serde(default)]
    pub developer_tools_attempts: u32,
}

impl ProctoringCounters {
    pub fn from_browser_info(info: &BrowserInfo) -> Self {
        Self {
            browser_name: info.name.clone(),
            browser_version: info.version.clone(),
            user_agent: info.user_agent.clone(),
            is_lockdown_browser: info.is_lockdown_browser,
            is_remote_monitor: info.is_remote_monitor,
            is_fullscreen_mode: info.is_fullscreen_mode,
            webcam_enabled: info.webcam_requested,
            ..Default::default()
        }
    }
}

/// Additive partial update merged into `ProctoringCounters`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterDelta {
    pub tab_switch_attempts: Option<u32>,
    pub window_blur_events: Option<u32>,
    pub fullscreen_exit_attempts: Option<u32>,
    pub page_visibility_hidden_events: Option<u32>,
    pub suspicious_requests_blocked: Option<u32>,
    pub external_domain_access_attempts: Option<u32>,
    pub keyboard_shortcut_attempts: Option<u32>,
    pub right_click_attempts: Option<u32>,
    pub developer_tools_attempts: Option<u32>,
    pub webcam_interruptions: Option<u32>,
}

impl CounterDelta {
    pub fn is_empty(&self) -> bool {
        self.tab_switch_attempts.is_none()
            && self.window_blur_events.is_none()
            && self.fullscreen_exit_attempts.is_none()
            && self.page_visibility_hidden_events.is_none()
            && self.suspicious_requests_blocked.is_none()
            && self.external_domain_access_attempts.is_none()
            && self.keyboard_shortcut_attempts.is_none()
            && self.right_click_attempts.is_none()
            && self.webcam_interruptions.is_none()
            && self.developer_tools_attempts.is_none()
    }

    pub fn apply_to(&self, counters: &mut ProctoringCounters) {
        fn bump(target: &mut u32, delta: Option<u32>) {
            if let Some(d) = delta {
                *target = target.saturating_add(d);
            }
        }
        bump(&mut counters.tab_switch_attempts, self.tab_switch_attempts);
        bump(&mut counters.window_blur_events, self.window_blur_events);
        bump(
            &mut counters.fullscreen_exit_attempts,
            self.fullscreen_exit_attempts,
        );
        bump(
            &mut counters.page_visibility_hidden_events,
            self.page_visibility_hidden_events,
        );
        bump(
            &mut counters.suspicious_requests_blocked,
            self.suspicious_requests_blocked,
        );
        bump(
            &mut counters.external_domain_access_attempts,
            self.external_domain_access_attempts,
        );
        bump(
            &mut counters.keyboard_shortcut_attempts,
            self.keyboard_shortcut_attempts,
        );
        bump(&mut counters.right_click_attempts, self.right_click_attempts);
        bump(
            &mut counters.developer_tools_attempts,
            self.developer_tools_attempts,
        );
        bump(&mut counters.webcam_interruptions, self.webcam_interruptions);
    }
}

/// One proctored exam session. Owned by the session state machine; all
/// mutation goes through the versioned store update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamSession {
    pub session_id: String,
    pub mock_test_id: String,
    pub user_id: String,
    pub exam_type: ExamType,
    pub status: SessionStatus,

    pub proctoring: ProctoringCounters,
    pub violations: Vec<Violation>,
    pub risk_score: u8,
    pub flagged: bool,
    pub flag_reason: Option<String>,

    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub heartbeat_last_received: DateTime<Utc>,
    pub heartbeat_missed_count: u32,

    pub starting_ip: Option<String>,
    pub current_ip: Option<String>,
    pub ip_changes: Vec<IpChange>,

    // Answer-integrity signals; informational only, never drive transitions.
    #[serde(default)]
    pub exact_answer_matches: u32,
    #[serde(default)]
    pub average_response_time_ms: f64,
    #[serde(default)]
    pub unusual_response_times: u32,

    #[serde(default)]
    pub delayed_result_processing: bool,
    pub result_processing_delayed_until: Option<DateTime<Utc>>,

    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Optimistic-concurrency version, bumped by the store on every write.
    pub version: u64,
}

impl ExamSession {
    pub fn new(
        session_id: String,
        mock_test_id: String,
        user_id: String,
        exam_type: ExamType,
        browser_info: &BrowserInfo,
        ip_address: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            mock_test_id,
            user_id,
            exam_type,
            status: SessionStatus::Active,
            proctoring: ProctoringCounters::from_browser_info(browser_info),
            violations: Vec::new(),
            risk_score: 0,
            flagged: false,
            flag_reason: None,
            start_time: now,
            end_time: None,
            duration_secs: None,
            heartbeat_last_received: now,
            heartbeat_missed_count: 0,
            starting_ip: ip_address.clone(),
            current_ip: ip_address,
            ip_changes: Vec::new(),
            exact_answer_matches: 0,
            average_response_time_ms: 0.0,
            unusual_response_times: 0,
            delayed_result_processing: false,
            result_processing_delayed_until: None,
            reviewed_at: None,
            review_notes: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}
