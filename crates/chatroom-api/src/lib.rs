pub mod auth;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod messages;
pub mod middleware;
pub mod profile;
pub mod rooms;
