//! MongoDB database wrapper.

use mongodb::{Client, Collection, options::ClientOptions};
use tracing::info;

use crate::error::{AuthzError, Result};

/// Database wrapper for MongoDB operations.
#[derive(Debug, Clone)]
pub struct Database {
    db: mongodb::Database,
}

impl Database {
    /// Connect to MongoDB with the given URI and database name.
    ///
    /// # Errors
    /// Returns `StoreUnavailable` if the connection or the ping fails.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        let options = ClientOptions::parse(uri)
            .await
            .map_err(|e| AuthzError::store("connect", e))?;
        let client = Client::with_options(options).map_err(|e| AuthzError::store("connect", e))?;

        // Ping the database to verify connection
        client
            .database("admin")
            .run_command(mongodb::bson::doc! { "ping": 1 })
            .await
            .map_err(|e| AuthzError::store("connect", e))?;

        info!("Successfully connected to MongoDB");

        Ok(Self {
            db: client.database(db_name),
        })
    }

    /// Get a typed collection from the database.
    pub fn collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        self.db.collection(name)
    }
}
