pub mod attempt_routes;
pub mod health;
pub mod session_routes;
