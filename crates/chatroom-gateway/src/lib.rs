pub mod broker;
pub mod channel;
pub mod connection;
pub mod registry;
