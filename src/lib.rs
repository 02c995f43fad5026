pub mod config;
pub mod console;
pub mod crash_report;
pub mod ipc;
pub mod notify;
pub mod process_monitor;
pub mod relay;
pub mod supervisor;
pub mod watchdog;
