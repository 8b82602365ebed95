//! Authority store: models, the store trait and its implementations.

pub mod memory;
pub mod models;
mod mongo;
mod mongo_store;
pub mod store;

pub use memory::MemoryAuthorityStore;
pub use models::*;
pub use mongo::Database;
pub use mongo_store::MongoAuthorityStore;
pub use store::AuthorityStore;
