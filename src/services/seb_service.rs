use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::dto::session_dto::SebConfigUrlResponse;
use crate::error::{Error, Result};
use crate::models::exam_session::{ExamSession, SessionStatus};
use crate::utils::time::now;

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies short-lived signed URLs for Safe Exam Browser
/// configuration downloads. The signature covers the session ID and the
/// expiry, so a URL cannot be replayed for another session or extended by
/// the client.
#[derive(Clone)]
pub struct SebService {
    signing_secret: String,
    public_base: String,
    token_ttl_secs: i64,
}

impl SebService {
    pub fn new(signing_secret: String, public_base: String, token_ttl_secs: i64) -> Self {
        Self {
            signing_secret,
            public_base: public_base.trim_end_matches('/').to_string(),
            token_ttl_secs: token_ttl_secs.max(1),
        }
    }

    pub fn issue_config_url(&self, session: &ExamSession) -> Result<SebConfigUrlResponse> {
        if session.status != SessionStatus::Active {
            return Err(Error::Conflict(format!(
                "SEB config is only issued for an active session (status: {})",
                session.status
            )));
        }
        let expires = (now() + chrono::Duration::seconds(self.token_ttl_secs)).timestamp_millis();
        let sig = self.sign(&session.session_id, expires)?;
        Ok(SebConfigUrlResponse {
            url: format!(
                "{}/api/exam-sessions/session/{}/seb-config?expires={}&sig={}",
                self.public_base, session.session_id, expires, sig
            ),
            expires,
        })
    }

    /// Checks a presented token. Expiry is reported separately from a bad
    /// signature so clients can distinguish "fetch a new URL" from
    /// tampering.
    pub fn verify(&self, session_id: &str, expires: i64, sig: &str) -> Result<()> {
        if now().timestamp_millis() > expires {
            return Err(Error::Unauthorized("SEB config link has expired".into()));
        }
        let expected = self.sign(session_id, expires)?;
        let expected_bytes = hex::decode(&expected)
            .map_err(|_| Error::Internal("SEB signature encoding failed".into()))?;
        let presented_bytes =
            hex::decode(sig).map_err(|_| Error::Unauthorized("Invalid SEB signature".into()))?;
        if expected_bytes.ct_eq(&presented_bytes).into() {
            Ok(())
        } else {
            Err(Error::Unauthorized("Invalid SEB signature".into()))
        }
    }

    fn sign(&self, session_id: &str, expires: i64) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .map_err(|_| Error::Config("SEB signing secret is empty".into()))?;
        mac.update(format!("{}:{}", session_id, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Renders the SEB configuration plist for a verified download. Locks
    /// the browser onto the exam origin with quit and reload disabled.
    pub fn build_seb_plist(&self, session: &ExamSession) -> String {
        let host = url::Url::parse(&self.public_base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());
        let start_url = format!(
            "{}/mock-test/{}?session={}",
            self.public_base, session.mock_test_id, session.session_id
        );

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>startURL</key>
    <string>{start_url}</string>
    <key>sebServerFallback</key>
    <false/>
    <key>allowQuit</key>
    <false/>
    <key>quitURL</key>
    <string>{base}/mock-test/completed</string>
    <key>browserWindowAllowReload</key>
    <false/>
    <key>showTaskBar</key>
    <false/>
    <key>enableAppSwitcherCheck</key>
    <true/>
    <key>forceAppFolderInstall</key>
    <true/>
    <key>allowPreferencesWindow</key>
    <false/>
    <key>allowSwitchToApplications</key>
    <false/>
    <key>enableRightMouse</key>
    <false/>
    <key>URLFilterEnable</key>
    <true/>
    <key>URLFilterRules</key>
    <array>
        <dict>
            <key>action</key>
            <integer>1</integer>
            <key>active</key>
            <true/>
            <key>expression</key>
            <string>{host}/*</string>
        </dict>
    </array>
</dict>
</plist>
"#,
            start_url = start_url,
            base = self.public_base,
            host = host,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::exam_session::{BrowserInfo, ExamType};

    fn service() -> SebService {
        SebService::new(
            "test-signing-secret".to_string(),
            "https://exam.example.com".to_string(),
            120,
        )
    }

    fn session(status: SessionStatus) -> ExamSession {
        let mut s = ExamSession::new(
            "SESS_abc123".into(),
            "mt-1".into(),
            "user-1".into(),
            ExamType::Jamb,
            &BrowserInfo::default(),
            None,
            now(),
        );
        s.status = status;
        s
    }

    #[test]
    fn issued_url_verifies() {
        let svc = service();
        let s = session(SessionStatus::Active);
        let issued = svc.issue_config_url(&s).unwrap();

        assert!(issued
            .url
            .starts_with("https://exam.example.com/api/exam-sessions/session/SESS_abc123/seb-config?"));
        let sig = issued.url.split("sig=").nth(1).unwrap();
        svc.verify(&s.session_id, issued.expires, sig).unwrap();
    }

    #[test]
    fn issuance_requires_active_session() {
        let svc = service();
        let err = svc
            .issue_config_url(&session(SessionStatus::Suspended))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn expired_token_is_rejected_as_expired() {
        let svc = service();
        let expires = now().timestamp_millis() - 1_000;
        let sig = svc.sign("SESS_abc123", expires).unwrap();
        let err = svc.verify("SESS_abc123", expires, &sig).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(msg) if msg.contains("expired")));
    }

    #[test]
    fn tampered_expiry_breaks_the_signature() {
        let svc = service();
        let s = session(SessionStatus::Active);
        let issued = svc.issue_config_url(&s).unwrap();
        let sig = issued.url.split("sig=").nth(1).unwrap();

        let err = svc
            .verify(&s.session_id, issued.expires + 60_000, sig)
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(msg) if msg.contains("Invalid")));
    }

    #[test]
    fn signature_is_bound_to_the_session() {
        let svc = service();
        let expires = now().timestamp_millis() + 60_000;
        let sig = svc.sign("SESS_abc123", expires).unwrap();
        assert!(svc.verify("SESS_other", expires, &sig).is_err());
    }

    #[test]
    fn different_secrets_produce_incompatible_signatures() {
        let svc = service();
        let other = SebService::new(
            "another-secret".to_string(),
            "https://exam.example.com".to_string(),
            120,
        );
        let expires = now().timestamp_millis() + 60_000;
        let sig = other.sign("SESS_abc123", expires).unwrap();
        assert!(svc.verify("SESS_abc123", expires, &sig).is_err());
    }

    #[test]
    fn plist_locks_onto_the_exam_origin() {
        let svc = service();
        let plist = svc.build_seb_plist(&session(SessionStatus::Active));
        assert!(plist.contains("<string>https://exam.example.com/mock-test/mt-1?session=SESS_abc123</string>"));
        assert!(plist.contains("exam.example.com/*"));
        assert!(plist.contains("<key>allowQuit</key>"));
    }
}
