#![allow(dead_code)]

use async_trait::async_trait;
use doc_context::driver::{IndexKeys, IndexKind, MemoryDriver};
use doc_context::error::BoxError;
use doc_context::{
    Aggregate, ChangesSaved, CollectionDefinition, CollectionListener, CollectionTracker,
    ContextResult, DocumentContext, Filter, IndexDefinition, Mutation, PendingMutations, Update,
    Weights,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const ARTICLES: &str = "articles";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: u32,
    pub title: String,
    pub body: String,
    pub created_at: i64,
    #[serde(default)]
    pub views: i64,
    #[serde(skip)]
    pending: PendingMutations<ArticleMutation>,
}

impl Article {
    pub fn new(id: u32, title: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            body: format!("body of {}", title),
            created_at: 1_700_000_000 + i64::from(id),
            ..Default::default()
        }
    }

    /// Instance carrying nothing but the primary key.
    pub fn key_only(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn change_title(&mut self, title: &str) {
        self.append(ArticleMutation::TitleChanged(title.to_string()));
    }

    pub fn view(&mut self) {
        self.append(ArticleMutation::Viewed);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArticleMutation {
    TitleChanged(String),
    Viewed,
}

impl Mutation<Article> for ArticleMutation {
    fn apply(&self, article: &mut Article) {
        match self {
            ArticleMutation::TitleChanged(title) => article.title = title.clone(),
            ArticleMutation::Viewed => article.views += 1,
        }
    }

    fn to_update(&self) -> Update {
        match self {
            ArticleMutation::TitleChanged(title) => Update::new().set("title", title.clone()),
            ArticleMutation::Viewed => Update::new().inc("views", 1),
        }
    }
}

impl Aggregate for Article {
    type Mutation = ArticleMutation;

    fn pending_mutations(&self) -> &PendingMutations<ArticleMutation> {
        &self.pending
    }
}

pub fn text_index() -> IndexDefinition {
    IndexDefinition::new(IndexKeys::text("title").then("body", IndexKind::Text))
        .weights(Weights::new().assign("title", 5).assign("body", 1))
}

pub fn created_at_index() -> IndexDefinition {
    IndexDefinition::new(IndexKeys::ascending("created_at"))
}

pub fn articles() -> CollectionDefinition<Article> {
    CollectionDefinition::new(ARTICLES, |article: &Article| Filter::eq("id", article.id))
        .has_index(text_index())
        .has_index(created_at_index())
}

/// Unique on `id`, so inserting a stored key fails the batch.
pub fn unique_articles() -> CollectionDefinition<Article> {
    articles().has_index(IndexDefinition::new(IndexKeys::ascending("id")).unique())
}

/// Mutations a listener saw, one entry per notification.
#[derive(Clone, Default)]
pub struct RecordingListener {
    pub seen: Arc<Mutex<Vec<Vec<ArticleMutation>>>>,
}

impl RecordingListener {
    pub fn notifications(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn last(&self) -> Option<Vec<ArticleMutation>> {
        self.seen.lock().last().cloned()
    }
}

#[async_trait]
impl CollectionListener<Article> for RecordingListener {
    async fn on_changes_saved(&self, changes: &ChangesSaved<Article>) -> Result<(), BoxError> {
        self.seen.lock().push(changes.mutations().cloned().collect());
        Ok(())
    }
}

pub struct FailingListener(pub &'static str);

#[async_trait]
impl CollectionListener<Article> for FailingListener {
    async fn on_changes_saved(&self, _changes: &ChangesSaved<Article>) -> Result<(), BoxError> {
        Err(self.0.into())
    }
}

/// Context over a fresh in-memory driver with the articles collection.
pub struct ArticlesContext {
    pub driver: MemoryDriver,
    pub context: DocumentContext<MemoryDriver>,
    pub articles: CollectionTracker<Article, MemoryDriver>,
}

impl ArticlesContext {
    pub async fn new() -> ContextResult<Self> {
        Self::with_definition(MemoryDriver::new(), articles()).await
    }

    pub async fn with_definition(
        driver: MemoryDriver,
        definition: CollectionDefinition<Article>,
    ) -> ContextResult<Self> {
        let context = DocumentContext::builder(driver.clone())
            .collection(definition.clone())
            .build()
            .await?;
        context.initialize().await?;
        let articles = context.collection(&definition)?;
        Ok(Self {
            driver,
            context,
            articles,
        })
    }

    pub fn stored(&self) -> Vec<serde_json::Value> {
        self.driver.documents(ARTICLES)
    }

    pub fn stored_ids(&self) -> Vec<u64> {
        self.stored()
            .iter()
            .filter_map(|doc| doc["id"].as_u64())
            .collect()
    }
}

pub fn key(id: u32) -> doc_context::PrimaryKey {
    doc_context::PrimaryKey::from_filter(&Filter::eq("id", id))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
