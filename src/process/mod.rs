//! Child process management for transports that talk to a spawned server

mod io;
mod manager;

pub use manager::ProcessManager;
