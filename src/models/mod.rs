pub mod exam_session;
