//! Elysium authorization core.
//!
//! Decides whether a principal may perform a privileged action in a guild and
//! keeps that decision cheap with expiring caches in front of the authority
//! store.
//!
//! ## Usage
//!
//! ```rust,ignore
//! elysium_authz::logging::init("elysium_authz=info");
//!
//! let config = Config::from_env()?;
//! let authority = Authority::connect_mongo(&config, directory).await?;
//! authority.prewarm().await;
//!
//! if authority.authorize(guild_id, user_id, &roles, 5).await.is_allowed() {
//!     // ...
//! }
//! ```

pub mod authority;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod permissions;

pub use authority::{Authority, Authorization, DenyReason};
pub use config::{BackendKind, Config};
pub use error::{AuthzError, Result};
