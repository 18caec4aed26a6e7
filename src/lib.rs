pub mod config;
pub mod error;
pub mod fanout;
pub mod identity;
pub mod membership;
pub mod messages;
pub mod models;
pub mod presence;
pub mod room;
pub mod server;
pub mod session;
pub mod store;
pub mod typing;

pub use config::{Args, Settings};
pub use error::{AuthError, ChatError, ConfigError, StoreError};
pub use identity::{IdentityService, SignedTokenIdentity};
pub use server::{routes, Server};
pub use store::{InMemoryStore, Store};
