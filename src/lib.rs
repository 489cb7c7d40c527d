#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod catalog;
pub mod config;
pub mod logging;
pub mod preview;
pub mod query;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod transport;
pub mod ui;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
