// Library root: re-exports all modules so integration tests and the binary
// can reach the crate's public API.

pub mod app;
pub mod battle;
pub mod clock;
pub mod config;
pub mod console;
pub mod db;
pub mod fallback;
pub mod link;
pub mod protocol;
pub mod session;
pub mod timer;
pub mod ws_client;
