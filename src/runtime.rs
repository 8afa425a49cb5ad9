//! Assembles the pipeline from configuration.
//!
//! Opens the SQLite pool, runs migrations and builds the configured
//! provider, notifier and object storage. The CLI commands and the HTTP
//! server all start from [`Runtime::open`].

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::driver::Pipeline;
use crate::migrate;
use crate::notify::{create_notifier, Notifier};
use crate::provider::{create_provider, LlmProvider};
use crate::storage::FsStorage;
use crate::store::sqlite::SqliteUnitStore;
use crate::store::UnitStore;

pub struct Runtime {
    pub config: Config,
    pub store: Arc<dyn UnitStore>,
    pub notifier: Arc<dyn Notifier>,
    pub pipeline: Arc<Pipeline>,
}

impl Runtime {
    pub async fn open(config: &Config) -> Result<Self> {
        let provider = create_provider(&config.provider)?;
        Self::open_with_provider(config, provider).await
    }

    /// Like [`Runtime::open`] with an explicit provider.
    pub async fn open_with_provider(config: &Config, provider: Arc<dyn LlmProvider>) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;

        let store: Arc<dyn UnitStore> = Arc::new(SqliteUnitStore::new(pool));
        let storage = Arc::new(FsStorage::new(&config.storage.root));
        let notifier = create_notifier(&config.notify)?;
        let pipeline = Arc::new(Pipeline::new(
            config,
            store.clone(),
            storage,
            provider,
            notifier.clone(),
        ));

        Ok(Self {
            config: config.clone(),
            store,
            notifier,
            pipeline,
        })
    }
}
