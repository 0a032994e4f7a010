pub mod adb;
pub mod auxiliary;
pub mod config;
pub mod device;
pub mod error;
pub mod http;
pub mod launcher;
pub mod logging;
pub mod models;
pub mod retry;
pub mod server;
pub mod session;
pub mod signal;
pub mod supervisor;

#[cfg(test)]
pub mod testing;
