pub mod agent;
pub mod cache;
pub mod config;
pub mod crash_guard;
pub mod daemon;
pub mod heartbeat;
pub mod lifecycle;
pub mod paths;
pub mod queue;
pub mod scheduler;
pub mod terminal;
