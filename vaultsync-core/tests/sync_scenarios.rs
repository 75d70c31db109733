//! End-to-end sync scenarios against an in-memory server.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use vaultsync_core::api::{ApiError, ConflictEntry, SyncApi, SyncRequest, SyncResponse};
use vaultsync_core::keys::KeyParams;
use vaultsync_core::model::find_or_create_singleton;
use vaultsync_core::payload::{ContentType, Payload, PayloadSource, RawPayload};
use vaultsync_core::protocol::{cost_minimum_for_version, ProtocolVersion};
use vaultsync_core::storage::{MemoryStore, PersistentStore};
use vaultsync_core::sync::{compute_integrity_hash, SyncEngine, SyncEvent, SyncOptions};
use vaultsync_core::{KeyManager, ModelManager};

// --- In-memory server ---

#[derive(Clone)]
struct ServerRecord {
    raw: RawPayload,
    seq: u64,
}

#[derive(Default)]
struct ServerState {
    records: HashMap<String, ServerRecord>,
    order: Vec<String>,
    seq: u64,
    sync_calls: usize,
    force_unauthorized: bool,
}

struct MockServer {
    state: Mutex<ServerState>,
    page_size: usize,
}

impl MockServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            page_size: 1_000,
        })
    }

    fn with_page_size(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            page_size,
        })
    }

    fn sync_calls(&self) -> usize {
        self.state.lock().unwrap().sync_calls
    }

    fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    fn set_unauthorized(&self, unauthorized: bool) {
        self.state.lock().unwrap().force_unauthorized = unauthorized;
    }

    /// Bump a record's update instant without advancing its sequence, so
    /// incremental syncs never re-deliver it: a persistent divergence.
    fn tamper_updated_at(&self, uuid: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(uuid) {
            record.raw.updated_at = record
                .raw
                .updated_at
                .map(|instant| instant + chrono::Duration::milliseconds(12_345));
        }
    }

    fn integrity_hash(state: &ServerState) -> String {
        let mut timestamps: Vec<i64> = state
            .records
            .values()
            .filter(|record| !record.raw.deleted.unwrap_or(false))
            .filter_map(|record| record.raw.updated_at.map(|d| d.timestamp_millis()))
            .collect();
        timestamps.sort_unstable_by(|a, b| b.cmp(a));
        compute_integrity_hash(&timestamps)
    }

    fn timestamp_for_seq(seq: u64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + seq as i64 * 1_000).unwrap()
    }

    fn process(&self, request: &SyncRequest) -> Result<SyncResponse, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.sync_calls += 1;
        if state.force_unauthorized {
            return Err(ApiError::InvalidSession);
        }

        let since: u64 = request
            .sync_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let offset: usize = request
            .cursor_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);

        let mut saved_items = Vec::new();
        let mut conflicts = Vec::new();
        let mut saved_uuids: HashSet<String> = HashSet::new();

        for item in &request.items {
            let existing = state.records.get(&item.uuid).cloned();
            if let Some(existing) = existing {
                // A stale write: the client's record predates the server's.
                if existing.raw.updated_at != item.updated_at {
                    conflicts.push(ConflictEntry {
                        conflict_type: "sync_conflict".to_string(),
                        server_item: existing.raw.clone(),
                    });
                    continue;
                }
            }

            state.seq += 1;
            let seq = state.seq;
            let mut stored = item.clone();
            stored.dirty = None;
            stored.created_at = stored.created_at.or_else(|| Some(Self::timestamp_for_seq(seq)));
            stored.updated_at = Some(Self::timestamp_for_seq(seq));

            saved_items.push(RawPayload {
                uuid: stored.uuid.clone(),
                content_type: stored.content_type.clone(),
                deleted: stored.deleted,
                created_at: stored.created_at,
                updated_at: stored.updated_at,
                ..Default::default()
            });
            saved_uuids.insert(stored.uuid.clone());

            if !state.records.contains_key(&stored.uuid) {
                state.order.push(stored.uuid.clone());
            }
            state
                .records
                .insert(stored.uuid.clone(), ServerRecord { raw: stored, seq });
        }

        let changed: Vec<RawPayload> = state
            .order
            .iter()
            .filter_map(|uuid| state.records.get(uuid))
            .filter(|record| record.seq > since && !saved_uuids.contains(&record.raw.uuid))
            .map(|record| record.raw.clone())
            .collect();

        let page: Vec<RawPayload> = changed.iter().skip(offset).take(self.page_size).cloned().collect();
        let cursor_token = if offset + page.len() < changed.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };

        // The high-water mark only advances once pagination drains.
        let sync_token = if cursor_token.is_some() {
            request.sync_token.clone()
        } else {
            Some(state.seq.to_string())
        };

        Ok(SyncResponse {
            retrieved_items: page,
            saved_items,
            conflicts,
            sync_token,
            cursor_token,
            integrity_hash: if request.compute_integrity {
                Some(Self::integrity_hash(&state))
            } else {
                None
            },
        })
    }
}

impl SyncApi for MockServer {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, ApiError> {
        self.process(request)
    }
}

// --- Client helpers ---

type Engine = SyncEngine<Arc<MockServer>, MemoryStore>;

fn new_client(server: &Arc<MockServer>) -> Engine {
    SyncEngine::new(
        server.clone(),
        MemoryStore::new(),
        Arc::new(Mutex::new(ModelManager::new())),
        Arc::new(Mutex::new(KeyManager::new())),
    )
}

/// Create an account on a client: install a root key and a default items
/// key, and queue the items key item for upload.
fn register(engine: &Engine, identifier: &str, password: &str) -> KeyParams {
    let keys = engine.key_manager();
    let (params, key_payload) = {
        let mut keys = keys.lock().unwrap();
        let (root, params) = keys
            .create_root_key(identifier, password, ProtocolVersion::V004)
            .unwrap();
        keys.set_root_key(root, Some(params.clone()));
        let items_key = keys.create_new_default_items_key().unwrap();
        (params, items_key.to_payload())
    };
    engine
        .model()
        .lock()
        .unwrap()
        .map_payloads_to_local_items(&[key_payload], PayloadSource::LocalDirtied);
    params
}

/// Sign in on a fresh client by rederiving the root key from key params.
fn sign_in(engine: &Engine, password: &str, params: &KeyParams) {
    let keys = engine.key_manager();
    let mut keys = keys.lock().unwrap();
    let root = keys.compute_root_key(password, params).unwrap();
    keys.set_root_key(root, Some(params.clone()));
}

fn create_note(engine: &Engine, uuid: &str, title: &str) {
    let payload = Payload::from_storage(&RawPayload {
        uuid: uuid.to_string(),
        content_type: "Note".to_string(),
        content: Some(json!({ "references": [], "title": title })),
        dirty: Some(true),
        ..Default::default()
    });
    engine
        .model()
        .lock()
        .unwrap()
        .map_payloads_to_local_items(&[payload], PayloadSource::LocalDirtied);
}

fn edit_note(engine: &Engine, uuid: &str, title: &str) {
    let model = engine.model();
    let mut model = model.lock().unwrap();
    let item = model.find(uuid).unwrap();
    let mut content = item.content().unwrap().clone();
    content
        .extra
        .insert("title".to_string(), json!(title));
    let payload = item
        .payload_representation(PayloadSource::LocalDirtied)
        .merged_with(&vaultsync_core::payload::PayloadOverride {
            content: Some(vaultsync_core::payload::PayloadContent::Decrypted(content)),
            dirty: Some(true),
            dirtied_date: Some(Utc::now()),
            ..Default::default()
        });
    model.map_payloads_to_local_items(&[payload], PayloadSource::LocalDirtied);
}

fn note_title(engine: &Engine, uuid: &str) -> Option<String> {
    let model = engine.model();
    let model = model.lock().unwrap();
    model
        .find(uuid)?
        .content()?
        .field("title")?
        .as_str()
        .map(str::to_string)
}

fn record_events(engine: &Engine) -> Arc<Mutex<Vec<SyncEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    engine
        .events()
        .add_observer("recorder", move |event| {
            events_clone.lock().unwrap().push(event.clone());
        })
        .unwrap();
    events
}

fn invalid_item_count(engine: &Engine) -> usize {
    let model = engine.model();
    let model = model.lock().unwrap();
    model
        .all_items()
        .into_iter()
        .filter(|item| item.error_decrypting() || item.waiting_for_key())
        .count()
}

// --- Scenarios ---

#[test]
fn cost_minimum_for_current_protocol() {
    assert_eq!(cost_minimum_for_version(ProtocolVersion::V004), 5);
}

#[tokio::test]
async fn full_sync_roundtrip_between_devices() {
    let server = MockServer::new();

    let device_a = new_client(&server);
    let params = register(&device_a, "hello@test.com", "correct horse battery");
    device_a.load_database().await.unwrap();
    create_note(&device_a, "note-1", "first");
    create_note(&device_a, "note-2", "second");
    device_a.sync(SyncOptions::default()).await.unwrap();

    // The server holds opaque records: the items key item plus two notes.
    assert_eq!(server.record_count(), 3);

    let device_b = new_client(&server);
    sign_in(&device_b, "correct horse battery", &params);
    device_b.load_database().await.unwrap();
    device_b.sync(SyncOptions::default()).await.unwrap();

    assert_eq!(note_title(&device_b, "note-1").as_deref(), Some("first"));
    assert_eq!(note_title(&device_b, "note-2").as_deref(), Some("second"));
    assert_eq!(invalid_item_count(&device_b), 0);
}

#[tokio::test]
async fn dirty_items_survive_in_storage_before_upload() {
    let server = MockServer::new();
    let engine = new_client(&server);
    register(&engine, "hello@test.com", "correct horse battery");
    engine.load_database().await.unwrap();
    create_note(&engine, "note-1", "draft");

    engine.sync(SyncOptions::default()).await.unwrap();

    // After a completed sync the stored copy is encrypted and clean.
    let stored = engine.store().get_all_raw_payloads().unwrap();
    let note = stored.iter().find(|raw| raw.uuid == "note-1").unwrap();
    let content = note.content.as_ref().unwrap().as_str().unwrap();
    assert!(content.starts_with("004:"));
    assert_eq!(note.dirty, Some(false));
}

#[tokio::test]
async fn concurrent_sync_calls_are_serialized() {
    let server = MockServer::new();
    let engine = new_client(&server);
    register(&engine, "hello@test.com", "correct horse battery");
    engine.load_database().await.unwrap();
    let events = record_events(&engine);

    create_note(&engine, "note-1", "first");
    let (a, b) = tokio::join!(
        engine.sync(SyncOptions::default()),
        engine.sync(SyncOptions::default())
    );
    a.unwrap();
    b.unwrap();

    let completed = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| **event == SyncEvent::FullSyncCompleted)
        .count();
    assert!(completed >= 1);
    assert!(
        !engine.try_cancel().unwrap(),
        "no operation should be running"
    );
    assert_eq!(note_title(&engine, "note-1").as_deref(), Some("first"));
}

#[tokio::test]
async fn pagination_downloads_all_records() {
    let server = MockServer::with_page_size(2);

    let device_a = new_client(&server);
    let params = register(&device_a, "hello@test.com", "correct horse battery");
    device_a.load_database().await.unwrap();
    for i in 0..7 {
        create_note(&device_a, &format!("note-{}", i), &format!("title {}", i));
    }
    device_a.sync(SyncOptions::default()).await.unwrap();

    let device_b = new_client(&server);
    sign_in(&device_b, "correct horse battery", &params);
    device_b.load_database().await.unwrap();
    device_b.sync(SyncOptions::default()).await.unwrap();

    for i in 0..7 {
        assert_eq!(
            note_title(&device_b, &format!("note-{}", i)).as_deref(),
            Some(format!("title {}", i).as_str())
        );
    }
}

#[tokio::test]
async fn stale_write_becomes_conflict_duplicate() {
    let server = MockServer::new();

    let device_a = new_client(&server);
    let params = register(&device_a, "hello@test.com", "correct horse battery");
    device_a.load_database().await.unwrap();
    create_note(&device_a, "note-1", "original");
    device_a.sync(SyncOptions::default()).await.unwrap();

    let device_b = new_client(&server);
    sign_in(&device_b, "correct horse battery", &params);
    device_b.load_database().await.unwrap();
    device_b.sync(SyncOptions::default()).await.unwrap();

    // A edits and wins the race; B edits the now-stale copy.
    edit_note(&device_a, "note-1", "a-edit");
    device_a.sync(SyncOptions::default()).await.unwrap();
    edit_note(&device_b, "note-1", "b-edit");
    device_b.sync(SyncOptions::default()).await.unwrap();

    // B adopted the server version under the original uuid and kept its
    // own edit as a new-uuid duplicate.
    assert_eq!(note_title(&device_b, "note-1").as_deref(), Some("a-edit"));
    let model = device_b.model();
    let model = model.lock().unwrap();
    let duplicates: Vec<_> = model
        .items_of_type(&ContentType::Note)
        .into_iter()
        .filter(|item| {
            item.content()
                .and_then(|c| c.duplicate_of.as_deref())
                .is_some()
        })
        .collect();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(
        duplicates[0].content().unwrap().field("title"),
        Some(&json!("b-edit"))
    );
    assert!(duplicates[0].dirty());
}

#[tokio::test]
async fn change_password_cycle_keeps_all_items_decryptable() {
    let server = MockServer::new();
    let engine = new_client(&server);
    let mut params = register(&engine, "hello@test.com", "password-gen-0");
    engine.load_database().await.unwrap();
    create_note(&engine, "note-1", "survives rotation");
    engine.sync(SyncOptions::default()).await.unwrap();

    let mut password = "password-gen-0".to_string();
    for generation in 1..=5 {
        password = format!("password-gen-{}", generation);
        let keys = engine.key_manager();
        let key_payload = {
            let mut keys = keys.lock().unwrap();
            let (root, new_params) = keys
                .create_root_key("hello@test.com", &password, ProtocolVersion::V004)
                .unwrap();
            keys.set_root_key(root, Some(new_params.clone()));
            params = new_params;
            // Each password change introduces exactly one new items key.
            keys.create_new_default_items_key().unwrap().to_payload()
        };
        {
            let model = engine.model();
            let mut model = model.lock().unwrap();
            model.map_payloads_to_local_items(&[key_payload], PayloadSource::LocalDirtied);
            // Re-encrypt every items key under the new root key.
            let key_uuids: Vec<String> = model
                .items_of_type(&ContentType::ItemsKey)
                .into_iter()
                .map(|item| item.uuid().to_string())
                .collect();
            model.set_items_dirty(&key_uuids, true);
        }
        engine.sync(SyncOptions::default()).await.unwrap();
    }

    assert_eq!(engine.key_manager().lock().unwrap().items_keys().len(), 6);

    // Sign out, sign back in with the latest password on a fresh device.
    let fresh = new_client(&server);
    sign_in(&fresh, &password, &params);
    fresh.load_database().await.unwrap();
    fresh.sync(SyncOptions::default()).await.unwrap();

    assert_eq!(fresh.key_manager().lock().unwrap().items_keys().len(), 6);
    assert_eq!(invalid_item_count(&fresh), 0);
    assert_eq!(
        note_title(&fresh, "note-1").as_deref(),
        Some("survives rotation")
    );
}

#[tokio::test]
async fn singleton_resolves_across_sign_in() {
    let server = MockServer::new();

    // An already-registered device owns the canonical privileges item.
    let device_a = new_client(&server);
    let params = register(&device_a, "hello@test.com", "correct horse battery");
    device_a.load_database().await.unwrap();
    let privileges_a = Payload::from_storage(&RawPayload {
        uuid: "privs-server".to_string(),
        content_type: "SN|Privileges".to_string(),
        content: Some(json!({ "references": [] })),
        dirty: Some(true),
        ..Default::default()
    });
    device_a
        .model()
        .lock()
        .unwrap()
        .map_payloads_to_local_items(&[privileges_a], PayloadSource::LocalDirtied);
    device_a.sync(SyncOptions::default()).await.unwrap();

    // A second device creates its own privileges item while signed out.
    let device_b = new_client(&server);
    device_b.load_database().await.unwrap();
    let privileges_b = Payload::from_storage(&RawPayload {
        uuid: "privs-local".to_string(),
        content_type: "SN|Privileges".to_string(),
        content: Some(json!({ "references": [] })),
        dirty: Some(true),
        ..Default::default()
    });
    device_b
        .model()
        .lock()
        .unwrap()
        .map_payloads_to_local_items(&[privileges_b], PayloadSource::LocalDirtied);
    device_b.sync(SyncOptions::default()).await.unwrap();

    // Sign in: first sync downloads the account's items key and the
    // server's privileges item, then local data re-uploads under it.
    sign_in(&device_b, "correct horse battery", &params);
    device_b.sync(SyncOptions::default()).await.unwrap();
    device_b.model().lock().unwrap().mark_all_items_as_needing_sync();
    device_b.sync(SyncOptions::default()).await.unwrap();

    let surviving = {
        let model = device_b.model();
        let mut model = model.lock().unwrap();
        find_or_create_singleton(
            &mut model,
            |item| *item.content_type() == ContentType::Privileges,
            || panic!("a candidate must exist"),
        )
    };
    device_b.sync(SyncOptions::default()).await.unwrap();

    let model = device_b.model();
    let model = model.lock().unwrap();
    let non_deleted: Vec<_> = model
        .items_of_type(&ContentType::Privileges)
        .into_iter()
        .filter(|item| !item.deleted())
        .collect();
    assert_eq!(non_deleted.len(), 1);
    assert_eq!(non_deleted[0].uuid(), surviving);
}

#[tokio::test]
async fn integrity_recovery_roundtrip() {
    let server = MockServer::new();
    let engine = new_client(&server);
    register(&engine, "hello@test.com", "correct horse battery");
    engine.load_database().await.unwrap();
    let events = record_events(&engine);

    create_note(&engine, "note-1", "shared");
    create_note(&engine, "note-2", "also shared");
    engine.sync(SyncOptions::default()).await.unwrap();

    // Diverge: the server's copy of note-1 silently changes.
    server.tamper_updated_at("note-1");

    let integrity = SyncOptions {
        check_integrity: true,
        ..Default::default()
    };
    for _ in 0..5 {
        engine.sync(integrity).await.unwrap();
    }
    assert!(engine.is_out_of_sync().unwrap());
    assert!(events.lock().unwrap().contains(&SyncEvent::EnterOutOfSync));

    engine.resolve_out_of_sync().await.unwrap();

    assert!(!engine.is_out_of_sync().unwrap());
    assert!(events.lock().unwrap().contains(&SyncEvent::ExitOutOfSync));
    assert_eq!(invalid_item_count(&engine), 0);
}

#[tokio::test]
async fn unauthorized_session_emits_invalid_session() {
    let server = MockServer::new();
    let engine = new_client(&server);
    register(&engine, "hello@test.com", "correct horse battery");
    engine.load_database().await.unwrap();
    let events = record_events(&engine);

    server.set_unauthorized(true);
    create_note(&engine, "note-1", "unreachable");
    let result = engine.sync(SyncOptions::default()).await;

    assert!(result.is_err());
    assert!(events.lock().unwrap().contains(&SyncEvent::InvalidSession));

    // Re-auth and retry through a fresh sync().
    server.set_unauthorized(false);
    engine.sync(SyncOptions::default()).await.unwrap();
    assert!(server.sync_calls() >= 2);
}

#[tokio::test]
async fn offline_changes_upload_after_sign_in() {
    let server = MockServer::new();
    let engine = new_client(&server);
    engine.load_database().await.unwrap();

    create_note(&engine, "note-1", "offline note");
    engine.sync(SyncOptions::default()).await.unwrap();

    // Nothing reached the server; the note was saved locally and cleaned.
    assert_eq!(server.record_count(), 0);
    assert!(!engine.model().lock().unwrap().find("note-1").unwrap().dirty());

    register(&engine, "hello@test.com", "correct horse battery");
    engine.model().lock().unwrap().mark_all_items_as_needing_sync();
    engine.sync(SyncOptions::default()).await.unwrap();

    assert!(server.record_count() >= 2);
    assert_eq!(note_title(&engine, "note-1").as_deref(), Some("offline note"));
}
