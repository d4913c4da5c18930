pub mod broker;
pub mod client;
pub mod config;
pub mod favorites;
pub mod history;
pub mod names;
pub mod persist;
pub mod picker;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod tail;
