pub mod cache;
pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod fallback;
pub mod forward;
pub mod mark;
pub mod message;
pub mod redirect;

pub use chain::{Chain, Next, Stage};
pub use context::QueryContext;
pub use error::{ConfigError, ResolveError, Result};
pub use message::Message;
