//! Driver over the official `mongodb` crate (feature `mongodb`).
//!
//! The address is a standard connection string that names the database,
//! e.g. `mongodb://127.0.0.1:27017/app`. `save` follows the classic
//! semantics: documents without `_id` are inserted, documents with one
//! replace (upsert) the stored copy.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures_util::StreamExt;
use mongodb::options::{FindOptions as MongoFindOptions, ReplaceOptions};
use tracing::debug;

use crate::config::ConnectOptions;
use crate::driver::{
    Client, Collection, DocumentStream, Driver, DriverError, FindOptions, NATIVE_ID_FIELD,
    SaveOutcome,
};

fn driver_error(err: mongodb::error::Error) -> DriverError {
    DriverError::new(err.to_string())
}

/// Connects with [`mongodb::Client::with_uri_str`].
#[derive(Clone, Debug, Default)]
pub struct MongoDriver;

impl MongoDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for MongoDriver {
    async fn connect(
        &self,
        address: &str,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn Client>, DriverError> {
        let client = mongodb::Client::with_uri_str(address)
            .await
            .map_err(driver_error)?;
        let database = client
            .default_database()
            .ok_or_else(|| DriverError::new(format!("no database named in {address}")))?;
        // The driver connects lazily; ping so failures surface here.
        database
            .run_command(doc! {"ping": 1}, None)
            .await
            .map_err(driver_error)?;
        debug!(database = %database.name(), "mongodb client connected");
        Ok(Arc::new(MongoClient { client, database }))
    }
}

struct MongoClient {
    client: mongodb::Client,
    database: mongodb::Database,
}

#[async_trait]
impl Client for MongoClient {
    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(MongoCollection {
            inner: self.database.collection::<Document>(name),
        })
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

struct MongoCollection {
    inner: mongodb::Collection<Document>,
}

#[async_trait]
impl Collection for MongoCollection {
    async fn save(&self, mut doc: Document) -> Result<SaveOutcome, DriverError> {
        match doc.get(NATIVE_ID_FIELD).cloned() {
            Some(id) => {
                let mut filter = Document::new();
                filter.insert(NATIVE_ID_FIELD, id);
                let mut options = ReplaceOptions::default();
                options.upsert = Some(true);
                let result = self
                    .inner
                    .replace_one(filter, &doc, options)
                    .await
                    .map_err(driver_error)?;
                if result.upserted_id.is_some() {
                    Ok(SaveOutcome::Inserted(doc))
                } else {
                    Ok(SaveOutcome::Updated(result.matched_count))
                }
            }
            None => {
                let result = self
                    .inner
                    .insert_one(&doc, None)
                    .await
                    .map_err(driver_error)?;
                let id: Bson = result.inserted_id;
                doc.insert(NATIVE_ID_FIELD, id);
                Ok(SaveOutcome::Inserted(doc))
            }
        }
    }

    async fn remove(&self, filter: Document) -> Result<u64, DriverError> {
        let result = self
            .inner
            .delete_many(filter, None)
            .await
            .map_err(driver_error)?;
        Ok(result.deleted_count)
    }

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<DocumentStream, DriverError> {
        let mut find_options = MongoFindOptions::default();
        find_options.limit = options.limit.map(|n| n as i64);
        find_options.skip = options.skip;
        find_options.sort = options.sort_document();

        let cursor = self
            .inner
            .find(filter, find_options)
            .await
            .map_err(driver_error)?;
        Ok(cursor.map(|item| item.map_err(driver_error)).boxed())
    }
}
