pub mod relay;
pub mod server;
pub mod watchdog;
