pub mod attempt_service;
pub mod monitor_service;
pub mod seb_service;
pub mod session_service;
