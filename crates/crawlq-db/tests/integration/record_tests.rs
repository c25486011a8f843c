use crawlq_core::error::AppError;
use crawlq_core::record::{CompareOp, Filter, FindOptions, Record, RecordStore, SortOrder};
use crawlq_core::testutil::make_test_result;
use crawlq_db::PgRecordStore;
use serde_json::json;

use crate::integration::common::setup_test_db;

fn record(url: &str, depth: u32, score: i64) -> Record {
    let mut result = make_test_result(url, "hackernews");
    result.depth = depth;
    result.insert("score", json!(score));
    result.insert("title", json!(format!("Post at {url}")));
    Record::from_result(&result, &[])
}

async fn seeded_store() -> (PgRecordStore, testcontainers::ContainerAsync<testcontainers::GenericImage>) {
    let (pool, container) = setup_test_db().await;
    let store = PgRecordStore::new(pool);
    store.create(&record("https://news.ycombinator.com/news", 0, 10)).await.unwrap();
    store.create(&record("https://news.ycombinator.com/item?id=1", 1, 250)).await.unwrap();
    store.create(&record("https://news.ycombinator.com/item?id=2", 1, 75)).await.unwrap();
    (store, container)
}

#[tokio::test]
async fn create_assigns_id_and_get_round_trips() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRecordStore::new(pool);

    let original = record("https://news.ycombinator.com/news", 0, 42);
    let id = store.create(&original).await.unwrap();
    assert!(!id.is_empty());

    let stored = store.get(&id).await.unwrap().expect("record exists");
    assert_eq!(stored.id, id);
    assert_eq!(stored.url, original.url);
    assert_eq!(stored.domain, "news.ycombinator.com");
    assert_eq!(stored.data["score"], 42);
    assert_eq!(stored.data_hash, original.data_hash);
}

#[tokio::test]
async fn create_keeps_caller_id() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRecordStore::new(pool);

    let mut r = record("https://a.test/", 0, 1);
    r.id = "fixed-id".into();
    assert_eq!(store.create(&r).await.unwrap(), "fixed-id");
}

#[tokio::test]
async fn get_missing_returns_none() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRecordStore::new(pool);

    assert!(store.get("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn update_and_delete() {
    let (pool, _container) = setup_test_db().await;
    let store = PgRecordStore::new(pool);

    let id = store.create(&record("https://a.test/", 0, 1)).await.unwrap();
    let mut stored = store.get(&id).await.unwrap().unwrap();
    stored.data.insert("score".into(), json!(2));
    store.update(&stored).await.unwrap();

    let updated = store.get(&id).await.unwrap().unwrap();
    assert_eq!(updated.data["score"], 2);

    store.delete(&id).await.unwrap();
    assert!(store.get(&id).await.unwrap().is_none());

    let err = store.delete(&id).await.unwrap_err();
    assert!(matches!(err, AppError::RecordNotFound(_)));
    let err = store.update(&stored).await.unwrap_err();
    assert!(matches!(err, AppError::RecordNotFound(_)));
}

#[tokio::test]
async fn find_by_column_and_data_key() {
    let (store, _container) = seeded_store().await;

    let comments = Filter::new().compare("depth", CompareOp::Gt, 0);
    assert_eq!(store.count(&comments).await.unwrap(), 2);

    let popular = Filter::new().compare("score", CompareOp::Gte, 100);
    let found = store.find(&popular, &FindOptions::default()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].url, "https://news.ycombinator.com/item?id=1");

    let range = Filter::new()
        .compare("score", CompareOp::Gt, 5)
        .compare("score", CompareOp::Lt, 100);
    assert_eq!(store.count(&range).await.unwrap(), 2);

    let not_front = Filter::new().compare("url", CompareOp::Ne, "https://news.ycombinator.com/news");
    assert_eq!(store.count(&not_front).await.unwrap(), 2);

    let successes = Filter::new().eq("error", serde_json::Value::Null);
    assert_eq!(store.count(&successes).await.unwrap(), 3);
}

#[tokio::test]
async fn find_sorts_and_pages() {
    let (store, _container) = seeded_store().await;

    let options = FindOptions::default()
        .sort_by("score", SortOrder::Desc)
        .with_limit(2);
    let found = store.find(&Filter::new(), &options).await.unwrap();
    let scores: Vec<_> = found.iter().map(|r| r.data["score"].clone()).collect();
    assert_eq!(scores, vec![json!(250), json!(75)]);

    let options = FindOptions::default()
        .sort_by("score", SortOrder::Desc)
        .with_offset(2);
    let found = store.find(&Filter::new(), &options).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].data["score"], 10);
}

#[tokio::test]
async fn find_one_and_document_filter() {
    let (store, _container) = seeded_store().await;

    let filter = Filter::from_json(&json!({"plan_name": "hackernews", "depth": {"$lte": 0}})).unwrap();
    let front = store.find_one(&filter).await.unwrap().expect("front page");
    assert_eq!(front.url, "https://news.ycombinator.com/news");

    let none = Filter::new().eq("plan_name", "other");
    assert!(store.find_one(&none).await.unwrap().is_none());
}

#[tokio::test]
async fn invalid_filter_is_rejected_before_query() {
    let (store, _container) = seeded_store().await;

    let err = store.count(&Filter::new().eq("depth", "zero")).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidFilter(_)));
}
