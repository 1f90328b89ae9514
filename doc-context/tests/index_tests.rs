mod common;

use common::*;
use doc_context::driver::{
    DocumentCollection, DocumentDriver, IndexKeys, IndexModel, IndexOptions, MemoryDriver,
};
use doc_context::{ConflictResolution, ContextError, IndexDefinition};
use pretty_assertions::assert_eq;

fn index_names(specs: &[doc_context::driver::IndexSpec]) -> Vec<String> {
    specs.iter().map(|spec| spec.name.clone()).collect()
}

#[tokio::test]
async fn test_initialize_creates_declared_indexes() {
    let ctx = ArticlesContext::new().await.unwrap();
    let indexes = ctx.articles.collection().list_indexes().await.unwrap();
    assert_eq!(
        index_names(&indexes),
        vec!["title_text_body_text", "created_at_1"]
    );
    assert_eq!(
        indexes[0].options.weights.as_ref().and_then(|w| w.get("title")),
        Some(&5)
    );
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let ctx = ArticlesContext::new().await.unwrap();
    let once = ctx.articles.collection().list_indexes().await.unwrap();

    ctx.context.initialize().await.unwrap();
    let twice = ctx.articles.collection().list_indexes().await.unwrap();

    assert_eq!(once, twice);
}

async fn driver_with_plain_created_at_index() -> MemoryDriver {
    let driver = MemoryDriver::new();
    driver
        .collection(ARTICLES)
        .create_index(&IndexModel::new(
            IndexKeys::ascending("created_at"),
            IndexOptions::default(),
        ))
        .await
        .unwrap();
    driver
}

fn expiring_created_at(resolution: ConflictResolution) -> IndexDefinition {
    IndexDefinition::new(IndexKeys::ascending("created_at"))
        .expire_after(std::time::Duration::from_secs(3600))
        .on_conflict(resolution)
}

#[tokio::test]
async fn test_conflict_without_policy_fails_initialization() {
    let driver = driver_with_plain_created_at_index().await;
    let before = driver.collection(ARTICLES).list_indexes().await.unwrap();

    let definition = doc_context::CollectionDefinition::new(ARTICLES, |a: &Article| {
        doc_context::Filter::eq("id", a.id)
    })
    .has_index(expiring_created_at(ConflictResolution::None));
    let err = ArticlesContext::with_definition(driver.clone(), definition)
        .await
        .err()
        .unwrap();

    assert!(err.is_index_conflict(), "{err}");
    assert_eq!(driver.collection(ARTICLES).list_indexes().await.unwrap(), before);
}

#[tokio::test]
async fn test_conflict_with_drop_policy_replaces_index() {
    let driver = driver_with_plain_created_at_index().await;

    let definition = doc_context::CollectionDefinition::new(ARTICLES, |a: &Article| {
        doc_context::Filter::eq("id", a.id)
    })
    .has_index(expiring_created_at(ConflictResolution::Drop));
    ArticlesContext::with_definition(driver.clone(), definition)
        .await
        .unwrap();

    let indexes = driver.collection(ARTICLES).list_indexes().await.unwrap();
    assert_eq!(index_names(&indexes), vec!["created_at_1"]);
    assert_eq!(indexes[0].options.expire_after_seconds, Some(3600));
}

#[tokio::test]
async fn test_renamed_index_conflict_is_resolved_by_name() {
    let driver = MemoryDriver::new();
    driver
        .collection(ARTICLES)
        .create_index(&IndexModel::new(
            IndexKeys::ascending("created_at"),
            IndexOptions {
                name: Some("by_creation".to_string()),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    let definition = doc_context::CollectionDefinition::new(ARTICLES, |a: &Article| {
        doc_context::Filter::eq("id", a.id)
    })
    .has_index(created_at_index().on_conflict(ConflictResolution::Drop));
    ArticlesContext::with_definition(driver.clone(), definition)
        .await
        .unwrap();

    let indexes = driver.collection(ARTICLES).list_indexes().await.unwrap();
    assert_eq!(index_names(&indexes), vec!["created_at_1"]);
}

#[tokio::test]
async fn test_first_index_failure_stops_initialization() {
    let driver = MemoryDriver::new();
    driver.seed(
        ARTICLES,
        [
            serde_json::to_value(Article::new(1, "same")).unwrap(),
            serde_json::to_value(Article::new(1, "same")).unwrap(),
        ],
    );

    let err = ArticlesContext::with_definition(driver.clone(), unique_articles())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, ContextError::Index { ref index, .. } if index == "id_1"), "{err}");
    // Earlier declarations stay in place.
    assert_eq!(
        index_names(&driver.collection(ARTICLES).list_indexes().await.unwrap()),
        vec!["title_text_body_text", "created_at_1"]
    );
}
