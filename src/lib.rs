//! replaycam - retroactive highlight capture.
//!
//! A camera device keeps a rolling buffer of encoded segments. A remote
//! device pairs with it over one of several transports and sends capture
//! signals; for each one the camera cuts "the last N seconds" out of the
//! buffer into a clip and records it in the highlight ledger.

pub mod app;
pub mod buffer;
pub mod capture;
pub mod clock;
pub mod config;
pub mod extract;
pub mod highlights;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod utils;

pub use config::AppConfig;
pub use utils::{AppError, AppResult, ErrorResponse};
