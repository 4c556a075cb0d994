pub mod battle;
pub mod collector;
pub mod config;
pub mod deck;
pub mod error;
pub mod fetch;
pub mod http_client;
pub mod roster;
pub mod source;
pub mod sqlite_store;
pub mod store;
