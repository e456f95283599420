//! Relay server.
//!
//! Puts an HTTP front end in front of [`relay_core`]: build requests arrive
//! as JSON over `POST /build`, run either in-process or on a pool of worker
//! processes, and watched builds push reload notifications to browsers over
//! server-sent events.
//!
//! # Modules
//!
//! - [`cli`] - command-line flags
//! - [`config`] - layered server configuration
//! - [`server`] - axum routes and the serve loop
//! - [`worker`] - worker pool and the worker process entry point
//! - [`protocol`] - worker messages and the `{error, data}` response body
//! - [`hmr`] - per-namespace HMR event hub
//! - [`error`], [`logger`], [`ui`] - ambient plumbing

pub mod cli;
pub mod config;
pub mod error;
pub mod hmr;
pub mod logger;
pub mod protocol;
pub mod server;
pub mod ui;
pub mod worker;

pub use config::ServerConfig;
pub use error::{CliError, Result, WorkerError};
pub use server::{AppState, Backend, router, serve};
