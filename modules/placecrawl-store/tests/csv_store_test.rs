//! On-disk behavior of the CSV store: header-once appends, idempotent writes,
//! the per-target single writer, and failure-log snapshots.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use placecrawl_common::{
    EntityId, FailureRecord, HomeFields, InfoFields, PlaceRecord, Review, TargetId, WorkItem,
};
use placecrawl_store::{export_json, CsvStore, FailureLog, RecordKind, RecordSink};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn place(target: &str, id: &str, reviews: usize) -> PlaceRecord {
    let item = WorkItem::new(target.into(), id.into(), format!("place {id}"));
    let mut record = PlaceRecord::from_payloads(&item, vec![], Utc::now());
    record.home = HomeFields {
        name: Some(format!("Place {id}")),
        category: Some("일반음식점".into()),
        rating: Some(4.5),
        ..Default::default()
    };
    record.info = InfoFields {
        services: vec!["주차".into(), "예약".into()],
        badges: vec![],
    };
    record.reviews = (0..reviews)
        .map(|n| Review {
            nickname: Some(format!("user{n}")),
            content: Some(format!("review {n}, with a comma")),
            ..Default::default()
        })
        .collect();
    record
}

fn read(path: &std::path::Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn header_count(text: &str, header_start: &str) -> usize {
    text.lines().filter(|l| l.starts_with(header_start)).count()
}

// ---------------------------------------------------------------------------
// RecordSink
// ---------------------------------------------------------------------------

#[tokio::test]
async fn header_written_once_across_appends() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let target = TargetId::new("A");

    store.write(&target, &[place("A", "1", 2)]).await.unwrap();
    store.write(&target, &[place("A", "3", 1)]).await.unwrap();

    let places = read(&store.artifact_path(&target, RecordKind::PlaceInfo));
    assert_eq!(header_count(&places, "place_id,"), 1);
    assert_eq!(places.lines().count(), 3);

    let reviews = read(&store.artifact_path(&target, RecordKind::Reviews));
    assert_eq!(header_count(&reviews, "place_id,"), 1);
    assert_eq!(reviews.lines().count(), 4);
}

#[tokio::test]
async fn writes_are_idempotent_per_entity() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let target = TargetId::new("A");

    let first = store.write(&target, &[place("A", "1", 2)]).await.unwrap();
    assert_eq!((first.places, first.reviews, first.duplicates), (1, 2, 0));

    let again = store
        .write(&target, &[place("A", "1", 2), place("A", "2", 0), place("A", "2", 0)])
        .await
        .unwrap();
    assert_eq!((again.places, again.reviews, again.duplicates), (1, 0, 2));

    let places = read(&store.artifact_path(&target, RecordKind::PlaceInfo));
    assert_eq!(places.lines().count(), 3);
}

#[tokio::test]
async fn retry_after_failed_place_append_keeps_reviews_single() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let target = TargetId::new("A");

    // A directory where the place file belongs makes the place append fail
    // after the reviews have been written.
    let place_path = store.artifact_path(&target, RecordKind::PlaceInfo);
    std::fs::create_dir_all(&place_path).unwrap();
    assert!(store.write(&target, &[place("A", "1", 2)]).await.is_err());
    assert!(!store.exists(&target, &EntityId::new("1")).await.unwrap());

    std::fs::remove_dir(&place_path).unwrap();
    let retried = store.write(&target, &[place("A", "1", 2)]).await.unwrap();
    assert_eq!((retried.places, retried.reviews), (1, 0));

    let reviews = read(&store.artifact_path(&target, RecordKind::Reviews));
    assert_eq!(reviews.lines().count(), 3);
    assert!(store.exists(&target, &EntityId::new("1")).await.unwrap());
}

#[tokio::test]
async fn exists_survives_a_fresh_store_instance() {
    let dir = tempfile::tempdir().unwrap();
    let target = TargetId::new("A");
    {
        let store = CsvStore::new(dir.path());
        store.write(&target, &[place("A", "2", 1)]).await.unwrap();
    }

    let reopened = CsvStore::new(dir.path());
    assert!(reopened.exists(&target, &EntityId::new("2")).await.unwrap());
    assert!(!reopened.exists(&target, &EntityId::new("1")).await.unwrap());
    assert!(!reopened.exists(&TargetId::new("B"), &EntityId::new("2")).await.unwrap());
}

#[tokio::test]
async fn concurrent_writers_to_one_target_produce_well_formed_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CsvStore::new(dir.path()));
    let target = TargetId::new("A");

    let writes = (0..32).map(|n| {
        let store = store.clone();
        let target = target.clone();
        tokio::spawn(async move {
            store
                .write(&target, &[place("A", &n.to_string(), 3)])
                .await
                .unwrap()
        })
    });
    for handle in join_all(writes).await {
        handle.unwrap();
    }

    let path = store.artifact_path(&target, RecordKind::PlaceInfo);
    let mut reader = csv::Reader::from_path(&path).unwrap();
    assert_eq!(reader.records().count(), 32);

    let review_path = store.artifact_path(&target, RecordKind::Reviews);
    let mut reader = csv::Reader::from_path(&review_path).unwrap();
    let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 96);
    assert!(rows.iter().all(|r| r.len() == 8));
}

#[tokio::test]
async fn record_for_other_target_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let result = store.write(&TargetId::new("A"), &[place("B", "1", 0)]).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn has_artifact_reflects_files_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let target = TargetId::new("A");
    assert!(!store.has_artifact(&target, RecordKind::PlaceInfo).await.unwrap());

    store.write(&target, &[place("A", "1", 0)]).await.unwrap();
    assert!(store.has_artifact(&target, RecordKind::PlaceInfo).await.unwrap());
    // No reviews were written, so no review artifact was created.
    assert!(!store.has_artifact(&target, RecordKind::Reviews).await.unwrap());
}

// ---------------------------------------------------------------------------
// FailureLog
// ---------------------------------------------------------------------------

fn failure(target: &str, id: &str, reason: &str) -> FailureRecord {
    let item = WorkItem::new(target.into(), id.into(), format!("place {id}"));
    FailureRecord::new(&item, reason)
}

#[tokio::test]
async fn failure_log_upserts_by_entity() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let target = TargetId::new("A");

    store.record(failure("A", "1", "timed out")).await.unwrap();
    store.record(failure("A", "2", "nav error")).await.unwrap();
    store.record(failure("A", "1", "reviews phase timed out")).await.unwrap();

    let rows = store.load(&target).await.unwrap();
    assert_eq!(rows.len(), 2);
    let one = rows.iter().find(|r| r.entity_id.as_str() == "1").unwrap();
    assert_eq!(one.reason, "reviews phase timed out");

    let text = read(&store.artifact_path(&target, RecordKind::Failures));
    assert!(text.starts_with("adm_dong_code,pid,pname,reason"));
}

#[tokio::test]
async fn resolve_rewrites_snapshot_and_removes_empty_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let target = TargetId::new("A");

    store.record(failure("A", "1", "x")).await.unwrap();
    store.record(failure("A", "2", "y")).await.unwrap();
    store.record(failure("B", "9", "z")).await.unwrap();
    assert_eq!(
        store.targets().await.unwrap(),
        vec![TargetId::new("A"), TargetId::new("B")]
    );

    assert!(store.resolve(&target, &EntityId::new("1")).await.unwrap());
    assert!(!store.resolve(&target, &EntityId::new("1")).await.unwrap());
    assert_eq!(store.load(&target).await.unwrap().len(), 1);

    assert!(store.resolve(&target, &EntityId::new("2")).await.unwrap());
    assert!(store.load(&target).await.unwrap().is_empty());
    assert!(!store.artifact_path(&target, RecordKind::Failures).exists());
    assert_eq!(store.targets().await.unwrap(), vec![TargetId::new("B")]);
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[tokio::test]
async fn export_drops_blank_cells() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    store
        .write(&TargetId::new("A"), &[place("A", "1", 1)])
        .await
        .unwrap();

    let summary = export_json(dir.path(), out.path()).unwrap();
    assert_eq!(summary.files, 2);
    assert_eq!(summary.rows, 2);

    let body = std::fs::read_to_string(out.path().join("place_info_A.json")).unwrap();
    let rows: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_str(&body).unwrap();
    assert_eq!(rows[0]["place_id"], "1");
    assert_eq!(rows[0]["services"], "주차, 예약");
    // address and opening_hours were never set
    assert!(!rows[0].contains_key("address"));
    assert!(!rows[0].contains_key("opening_hours"));
    // keys follow the CSV column order
    let keys: Vec<&str> = rows[0].keys().take(4).map(String::as_str).collect();
    assert_eq!(keys, ["place_id", "adm_dong_code", "name", "category"]);
}
