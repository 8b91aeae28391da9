#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//!
//! use rbayeux::conf::Settings;
//! use rbayeux::context::ServerContext;
//! use rbayeux::message::Message;
//! use rbayeux::server::BayeuxServer;
//! use rbayeux::sweeper::Sweeper;
//!
//! #[tokio::main]
//! async fn main() -> rbayeux::Result<()> {
//!     let settings = Settings::init(None)?;
//!     let _guard = rbayeux::logger::logger_init(&settings.log)?;
//!
//!     let scx = ServerContext::new(settings.clone());
//!     let sweeper = Sweeper::new(scx.clone());
//!     sweeper.start();
//!
//!     let server = BayeuxServer::new(scx);
//!     // A transport parses each request and hands it over.
//!     let reply = server.handle(Message::new("/meta/handshake")).await;
//!     println!("{}", reply.map(|r| r.to_json()).transpose()?.unwrap_or_default());
//!     Ok(())
//! }
//! ```

pub mod channel; // Channel ids and wildcard matching
pub mod context; // Shared server components
pub mod dispatch; // Channel tree and publish routing
pub mod error;
pub mod extension; // Incoming/outgoing interceptors
pub mod logger;
pub mod message; // Wire message model
pub mod presence; // User to session index
pub mod registry; // Session store
pub mod security; // Authorization gate
pub mod server; // Meta channel protocol processing
pub mod service; // Application services
pub mod session;
pub mod stats;
pub mod sweeper; // Idle session expiry
pub mod types;
pub mod utils;

pub use error::BayeuxError;
pub use rbayeux_conf as conf;

pub type Result<T> = std::result::Result<T, BayeuxError>;
