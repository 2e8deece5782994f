pub mod action;
pub mod connection;
pub mod events;
pub mod registry;
pub mod router;
pub mod server;
