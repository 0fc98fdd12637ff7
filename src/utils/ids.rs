use rand::{distributions::Alphanumeric, thread_rng, Rng};

use crate::models::exam_session::ExamType;
use crate::models::mock_test::EXAM_ID_LEN;

/// Opaque session identifier: `SESS_` + 32 hex chars.
pub fn generate_session_id() -> String {
    let mut rng = thread_rng();
    let hex: String = (0..32)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect();
    format!("SESS_{}", hex)
}

/// Candidate exam ID: `J`/`W` prefix plus uppercase alphanumerics to a
/// total of 12. Uniqueness is enforced by the store; callers retry on
/// collision.
pub fn generate_exam_id(exam_type: ExamType) -> String {
    let mut id = String::with_capacity(EXAM_ID_LEN);
    id.push(exam_type.exam_id_prefix());
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(EXAM_ID_LEN - 1)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect();
    id.push_str(&suffix);
    id
}
