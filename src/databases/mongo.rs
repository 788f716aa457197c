use std::sync::OnceLock;

use mongodb::{Client, Database};
use tracing::info;

static MONGO_DB: OnceLock<MongoDb> = OnceLock::new();

pub struct MongoDb {
    pub db: Database,
}

impl MongoDb {
    pub async fn init() {
        let uri = std::env::var("MONGODB_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let db_name =
            std::env::var("MONGODB_DB_NAME").unwrap_or_else(|_| "quizblitz".to_string());
        info!(%db_name, "connecting to MongoDB");
        let client = Client::with_uri_str(&uri)
            .await
            .expect("can't connect to MongoDB");
        let db = client.database(&db_name);
        info!("connected to MongoDB");
        MONGO_DB.get_or_init(|| MongoDb { db });
    }

    pub fn get_instance() -> &'static MongoDb {
        MONGO_DB.get().expect("MongoDb not initialized")
    }
}
