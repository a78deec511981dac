//! HTTP route handlers.

pub mod health;
pub mod logout;
pub mod session;
pub mod state;
pub mod token;
