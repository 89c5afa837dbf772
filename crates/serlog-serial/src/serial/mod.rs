//! Serial crate: sub-modules.

pub mod error;
pub mod types;
pub mod config;
pub mod transport;
pub mod framer;
pub mod hub;
pub mod history;
pub mod writer;
pub mod reader;
pub mod logging;
pub mod session;

// Re-export top-level items for convenience.
pub use config::SessionConfig;
pub use error::{SerialError, SerialErrorKind, SerialResult};
pub use session::SerialSession;
pub use types::*;
