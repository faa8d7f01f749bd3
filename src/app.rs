//! Service wiring.
//!
//! [`Backends`] collects every collaborator behind a trait object;
//! [`DocChat`] builds the status tracker, ingestion pipeline, chat cache
//! and answer composer on top of them. The server and CLI construct one
//! `DocChat` from config; tests fill `Backends` with in-memory stores and
//! deterministic fakes.

use std::sync::Arc;

use anyhow::Result;

use docchat_core::cache::ChatContextCache;
use docchat_core::embedding::Embedder;
use docchat_core::store::{DocumentStore, MessageStore, VectorIndex};

use crate::composer::{AnswerComposer, ComposerSettings};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::extract::{FormatExtractor, TextExtractor};
use crate::ingest::{IngestPipeline, IngestSettings};
use crate::llm::{create_language_model, LanguageModel};
use crate::objects::{FsObjectStore, ObjectStore};
use crate::sqlite_store::SqliteStore;
use crate::status::StatusTracker;
use crate::{db, migrate};

pub struct Backends {
    pub documents: Arc<dyn DocumentStore>,
    pub index: Arc<dyn VectorIndex>,
    pub messages: Arc<dyn MessageStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub extractor: Arc<dyn TextExtractor>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn LanguageModel>,
}

impl Backends {
    /// SQLite, filesystem object storage and the configured providers.
    /// Applies migrations, so a fresh database works without `init`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));
        Ok(Self {
            documents: store.clone(),
            index: store.clone(),
            messages: store,
            objects: Arc::new(FsObjectStore::new(&config.storage.root)),
            extractor: Arc::new(FormatExtractor),
            embedder: create_embedder(&config.embedding)?,
            llm: create_language_model(&config.llm)?,
        })
    }
}

/// Everything a request handler needs, cheap to clone.
#[derive(Clone)]
pub struct DocChat {
    pub config: Arc<Config>,
    pub tracker: Arc<StatusTracker>,
    pub pipeline: Arc<IngestPipeline>,
    pub composer: Arc<AnswerComposer>,
    pub cache: Arc<ChatContextCache>,
}

impl DocChat {
    pub fn new(config: &Config, backends: Backends) -> Result<Self> {
        let tracker = Arc::new(StatusTracker::new(backends.documents.clone()));
        let cache = Arc::new(ChatContextCache::new(
            config.cache.max_chats,
            config.cache.max_turns,
        )?);

        let pipeline = Arc::new(IngestPipeline::new(
            backends.documents.clone(),
            backends.index.clone(),
            backends.objects,
            backends.extractor,
            backends.embedder.clone(),
            tracker.clone(),
            IngestSettings::from_config(config),
        ));
        let composer = Arc::new(AnswerComposer::new(
            backends.documents,
            backends.index,
            backends.messages,
            backends.embedder,
            backends.llm,
            cache.clone(),
            ComposerSettings::from_config(config),
        ));

        Ok(Self {
            config: Arc::new(config.clone()),
            tracker,
            pipeline,
            composer,
            cache,
        })
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        let backends = Backends::from_config(config).await?;
        Self::new(config, backends)
    }
}
