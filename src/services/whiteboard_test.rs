use super::*;
use crate::state::test_helpers::{attach, identity, test_state};

fn element(id: &str) -> Element {
    let mut body = Map::new();
    body.insert("type".into(), serde_json::json!("sticky_note"));
    body.insert("x".into(), serde_json::json!(10.0));
    body.insert("y".into(), serde_json::json!(20.0));
    Element { id: id.into(), body }
}

fn element_at(id: &str, x: f64) -> Element {
    let mut el = element(id);
    el.body.insert("x".into(), serde_json::json!(x));
    el
}

// =============================================================================
// DOCUMENT MODEL
// =============================================================================

#[test]
fn empty_document_is_version_zero() {
    let doc = Whiteboard::empty(Uuid::new_v4());
    assert_eq!(doc.version, 0);
    assert!(doc.elements.is_empty());
    assert!(doc.snapshots.is_empty());
    assert!(doc.last_modified_by.is_none());
}

#[test]
fn mutations_increment_version_by_exactly_one() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();

    doc.create_element(element("e1"), author, 1);
    assert_eq!(doc.version, 1);

    let mut patch = Map::new();
    patch.insert("x".into(), serde_json::json!(99.0));
    doc.update_element("e1", &patch, author, 2).unwrap();
    assert_eq!(doc.version, 2);

    doc.replace(vec![element("e1"), element("e2")], None, None, author, 3);
    assert_eq!(doc.version, 3);

    doc.delete_element("e2", author, 4).unwrap();
    assert_eq!(doc.version, 4);

    assert_eq!(doc.last_modified_by, Some(author));
    assert_eq!(doc.last_modified_at, 4);
}

#[test]
fn version_never_advances_on_rejected_mutations() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();
    doc.create_element(element("e1"), author, 1);

    let patch = Map::new();
    assert!(matches!(
        doc.update_element("missing", &patch, author, 2),
        Err(WhiteboardError::ElementNotFound(_))
    ));
    assert!(matches!(
        doc.delete_element("missing", author, 2),
        Err(WhiteboardError::ElementNotFound(_))
    ));
    assert!(matches!(
        doc.restore(7, author, 2),
        Err(WhiteboardError::SnapshotNotFound(7))
    ));
    assert_eq!(doc.version, 1);
    assert_eq!(doc.elements.len(), 1);
}

#[test]
fn update_merges_patch_and_keeps_id() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();
    doc.create_element(element("e1"), author, 1);

    let mut patch = Map::new();
    patch.insert("x".into(), serde_json::json!(50.0));
    patch.insert("color".into(), serde_json::json!("#FF0000"));
    patch.insert("id".into(), serde_json::json!("hijack"));

    let updated = doc.update_element("e1", &patch, author, 2).unwrap();
    assert_eq!(updated.id, "e1");
    assert_eq!(updated.body.get("x").and_then(serde_json::Value::as_f64), Some(50.0));
    assert_eq!(updated.body.get("color").and_then(|v| v.as_str()), Some("#FF0000"));
    // Untouched fields survive the merge.
    assert_eq!(updated.body.get("y").and_then(serde_json::Value::as_f64), Some(20.0));
    assert!(!updated.body.contains_key("id"));
}

#[test]
fn delete_removes_by_id() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();
    doc.create_element(element("e1"), author, 1);
    doc.create_element(element("e2"), author, 2);

    doc.delete_element("e1", author, 3).unwrap();
    assert_eq!(doc.elements.len(), 1);
    assert_eq!(doc.elements[0].id, "e2");
}

#[test]
fn changed_count_is_added_removed_modified() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();
    doc.replace(vec![element("a"), element("b"), element("c")], None, None, author, 1);

    // "a" unchanged, "b" moved, "c" removed, "d" added → 3 changes.
    let incoming = vec![element("a"), element_at("b", 999.0), element("d")];
    assert_eq!(doc.changed_count(&incoming), 3);

    // Identical list → 0 changes.
    let same = doc.elements.clone();
    assert_eq!(doc.changed_count(&same), 0);
}

#[test]
fn replace_sets_view_state_and_files_when_given() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();

    doc.replace(
        vec![element("e1")],
        Some(serde_json::json!({"zoom": 1.5})),
        Some(serde_json::json!({"f1": {"name": "a.png"}})),
        author,
        1,
    );
    assert_eq!(doc.view_state.get("zoom").and_then(serde_json::Value::as_f64), Some(1.5));
    assert!(doc.files.get("f1").is_some());

    // Omitted fields are left alone.
    doc.replace(vec![element("e2")], None, None, author, 2);
    assert_eq!(doc.view_state.get("zoom").and_then(serde_json::Value::as_f64), Some(1.5));
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

#[test]
fn bulk_replace_snapshots_the_prior_state() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();
    doc.create_element(element("original"), author, 1);

    // Eleven fresh elements plus the removal of "original": well past the
    // threshold.
    let incoming: Vec<Element> = (0..11).map(|i| element(&format!("n{i}"))).collect();
    doc.replace(incoming, None, None, author, 2);

    assert_eq!(doc.snapshots.len(), 1);
    let snap = &doc.snapshots[0];
    assert_eq!(snap.elements.len(), 1);
    assert_eq!(snap.elements[0].id, "original");
    assert_eq!(snap.version, 1);
    assert_eq!(doc.version, 2);
}

#[test]
fn small_replace_takes_no_snapshot() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();

    let incoming: Vec<Element> = (0..SNAPSHOT_ELEMENT_THRESHOLD).map(|i| element(&format!("n{i}"))).collect();
    doc.replace(incoming, None, None, author, 1);
    assert!(doc.snapshots.is_empty());
}

#[test]
fn snapshot_list_is_bounded_to_fifty() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();
    doc.create_element(element("e1"), author, 1);

    for i in 0..(SNAPSHOT_LIMIT + 5) {
        doc.take_snapshot(author, i as i64);
    }

    assert_eq!(doc.snapshots.len(), SNAPSHOT_LIMIT);
    // The five oldest were evicted.
    assert_eq!(doc.snapshots.first().map(|s| s.ts), Some(5));
    assert_eq!(doc.snapshots.last().map(|s| s.ts), Some((SNAPSHOT_LIMIT + 4) as i64));
}

#[test]
fn take_snapshot_does_not_advance_the_version() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();
    doc.create_element(element("e1"), author, 1);

    let version = doc.take_snapshot(author, 2);
    assert_eq!(version, 1);
    assert_eq!(doc.version, 1);
    assert_eq!(doc.snapshots.len(), 1);
}

#[test]
fn restore_rewinds_content_and_bumps_version() {
    let mut doc = Whiteboard::empty(Uuid::new_v4());
    let author = Uuid::new_v4();
    doc.create_element(element("keep"), author, 1);
    doc.take_snapshot(author, 2);

    doc.create_element(element("later"), author, 3);
    assert_eq!(doc.version, 2);

    let restorer = Uuid::new_v4();
    doc.restore(1, restorer, 4).unwrap();

    assert_eq!(doc.elements.len(), 1);
    assert_eq!(doc.elements[0].id, "keep");
    // A restore is a mutation like any other: version moves forward.
    assert_eq!(doc.version, 3);
    assert_eq!(doc.last_modified_by, Some(restorer));
}

// =============================================================================
// SERVICE
// =============================================================================

#[tokio::test]
async fn load_document_defaults_to_empty() {
    let harness = test_state();
    let room_id = Uuid::new_v4();

    let doc = load_document(&harness.state, room_id).await.unwrap();
    assert_eq!(doc.version, 0);
    assert!(doc.elements.is_empty());
}

#[tokio::test]
async fn load_document_reads_the_store() {
    let harness = test_state();
    let room_id = Uuid::new_v4();

    let mut doc = Whiteboard::empty(room_id);
    doc.create_element(element("e1"), Uuid::new_v4(), 1);
    harness.documents.save(&doc).await.unwrap();

    let loaded = load_document(&harness.state, room_id).await.unwrap();
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.elements.len(), 1);
}

#[tokio::test]
async fn mutate_persists_after_every_accepted_mutation() {
    let harness = test_state();
    let room_id = Uuid::new_v4();
    let member = identity("ada");
    let (_conn, _rx) = attach(&harness.state, room_id, &member).await;

    let (doc, ()) = mutate(&harness.state, room_id, |doc| {
        doc.create_element(element("e1"), member.id, 1);
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(doc.version, 1);

    // The store holds the full new state, not just memory.
    let persisted = harness.documents.load(room_id).await.unwrap().unwrap();
    assert_eq!(persisted.version, 1);
    assert_eq!(persisted.elements.len(), 1);
}

#[tokio::test]
async fn mutate_hydrates_from_the_store_first() {
    let harness = test_state();
    let room_id = Uuid::new_v4();
    let member = identity("ada");

    let mut seeded = Whiteboard::empty(room_id);
    seeded.create_element(element("old"), member.id, 1);
    harness.documents.save(&seeded).await.unwrap();

    let (_conn, _rx) = attach(&harness.state, room_id, &member).await;
    let (doc, ()) = mutate(&harness.state, room_id, |doc| {
        doc.create_element(element("new"), member.id, 2);
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(doc.version, 2);
    assert_eq!(doc.elements.len(), 2);
}

#[tokio::test]
async fn mutate_requires_a_live_channel() {
    let harness = test_state();
    let err = mutate(&harness.state, Uuid::new_v4(), |_| Ok(())).await.unwrap_err();
    assert!(matches!(err, WhiteboardError::NotMember(_)));
}

struct FailingDocumentStore;

#[async_trait]
impl DocumentStore for FailingDocumentStore {
    async fn load(&self, _room_id: Uuid) -> Result<Option<Whiteboard>, DocumentStoreError> {
        Ok(None)
    }

    async fn save(&self, _doc: &Whiteboard) -> Result<(), DocumentStoreError> {
        Err(DocumentStoreError::Unavailable)
    }
}

#[tokio::test]
async fn writes_fail_closed_when_the_store_is_down() {
    let harness = test_state();
    let room_id = Uuid::new_v4();
    let member = identity("ada");
    let (_conn, _rx) = attach(&harness.state, room_id, &member).await;

    // First mutation succeeds and lands in memory.
    mutate(&harness.state, room_id, |doc| {
        doc.create_element(element("e1"), member.id, 1);
        Ok(())
    })
    .await
    .unwrap();

    // Same shared channel registry, but a dead document store.
    let mut broken = harness.state.clone();
    broken.documents = std::sync::Arc::new(FailingDocumentStore);

    let err = mutate(&broken, room_id, |doc| {
        doc.create_element(element("e2"), member.id, 2);
        Ok(())
    })
    .await
    .unwrap_err();
    assert!(matches!(err, WhiteboardError::Store(_)));

    // The in-memory document is untouched: still version 1, one element.
    let doc = load_document(&harness.state, room_id).await.unwrap();
    assert_eq!(doc.version, 1);
    assert_eq!(doc.elements.len(), 1);
}

#[tokio::test]
async fn closure_errors_leave_memory_and_store_untouched() {
    let harness = test_state();
    let room_id = Uuid::new_v4();
    let member = identity("ada");
    let (_conn, _rx) = attach(&harness.state, room_id, &member).await;

    mutate(&harness.state, room_id, |doc| {
        doc.create_element(element("e1"), member.id, 1);
        Ok(())
    })
    .await
    .unwrap();

    let err = mutate(&harness.state, room_id, |doc| {
        doc.update_element("missing", &Map::new(), member.id, 2).map(|_| ())
    })
    .await
    .unwrap_err();
    assert!(matches!(err, WhiteboardError::ElementNotFound(_)));

    let persisted = harness.documents.load(room_id).await.unwrap().unwrap();
    assert_eq!(persisted.version, 1);
}

#[test]
fn element_serde_keeps_the_body_opaque() {
    let raw = serde_json::json!({
        "id": "e1",
        "type": "arrow",
        "points": [[0, 0], [10, 10]],
        "boundTo": "e2"
    });
    let el: Element = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(el.id, "e1");
    assert_eq!(el.body.get("boundTo").and_then(|v| v.as_str()), Some("e2"));

    let back = serde_json::to_value(&el).unwrap();
    assert_eq!(back, raw);
}
