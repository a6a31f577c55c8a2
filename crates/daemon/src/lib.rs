//! # dirshare Daemon Library
//!
//! Serves one local directory tree to file-transfer clients. Each client
//! session speaks the request/response protocol from the `protocol` crate;
//! the daemon maps every request onto the filesystem beneath a configured
//! root directory.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │            SessionListener / serve_connection            │
//! │        frames in ──▶ dispatch      responses ──▶ frames  │
//! ├──────────────────────────────────────────────────────────┤
//! │                      Dispatcher                          │
//! │  ┌──────────────┐  ┌────────────────┐  ┌──────────────┐  │
//! │  │ PathResolver │  │ HandleRegistry │  │  Directory   │  │
//! │  │              │  │                │  │  listings    │  │
//! │  └──────────────┘  └────────────────┘  └──────────────┘  │
//! ├──────────────────────────────────────────────────────────┤
//! │                FileSystem (LocalFs)                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use daemon::{serve_connection, Config, LocalFs};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let root = config.ensure_root_dir()?;
//!
//!     serve_connection(
//!         tokio::io::stdin(),
//!         tokio::io::stdout(),
//!         Arc::new(LocalFs::new()),
//!         config.session_settings(root),
//!         config.frame_codec(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`dispatcher`]: Per-session request handling
//! - [`files`]: Path confinement, handles, listings, filesystem access
//! - [`logging`]: Tracing setup
//! - [`transport`]: Framed sessions over streams and Unix sockets

pub mod config;
pub mod dispatcher;
pub mod files;
pub mod logging;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use dispatcher::{DispatchError, Dispatcher, ResponseSink, SessionSettings};
pub use files::{FileSystem, HandleRegistry, LocalFs, PathResolver, ResolveError};
pub use transport::{serve_connection, SessionListener, SessionStats, TransportError};
