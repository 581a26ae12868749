pub mod commands;
pub mod config;
pub mod logging;
pub mod runner;
pub mod web;

pub use config::{ConfigError, ListenAddr, ListenAddrError, Settings};
pub use logging::{LoggingError, RotatingFile};
pub use runner::{Launched, Runner, RunnerError, ShellRunner};
pub use web::{AppState, ServerError, WebhookError, create_app, serve, start_server};
