pub mod config;
pub mod error;
pub mod hash;
pub mod logging;
pub mod session;
pub mod traits;
pub mod types;
pub mod watch;

pub use config::*;
pub use error::*;
pub use hash::*;
pub use logging::init_tracing;
pub use session::{InMemorySession, StaticContent};
pub use traits::*;
pub use types::*;
pub use watch::*;
