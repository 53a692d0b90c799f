pub mod connection;
pub mod heartbeat;
pub mod router;
pub mod subscriptions;
