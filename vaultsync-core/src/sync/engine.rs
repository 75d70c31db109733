//! The sync engine: drives multi-round incremental sync against the
//! server, serializes concurrent callers through two queues, tracks
//! integrity, and recovers from out-of-sync.
//!
//! At most one sync operation runs at a time. All item-graph mutation
//! happens on the engine's logical thread; locks are never held across a
//! suspension point, and a poisoned lock surfaces as [`CoreError::Lock`]
//! rather than a panic.

use crate::api::{ApiError, SyncApi, SyncRequest, SyncResponse};
use crate::keys::KeyManager;
use crate::model::ModelManager;
use crate::payload::delta::delta_out_of_sync;
use crate::payload::{
    ContentType, Payload, PayloadCollection, PayloadFormat, PayloadSource, RawPayload,
};
use crate::protocol::{EncryptionIntent, ProtocolManager};
use crate::storage::{PersistentStore, LAST_SYNC_TOKEN_KEY, PAGINATION_TOKEN_KEY};
use crate::sync::{
    compute_integrity_hash, EventRegistry, IntegrityOutcome, OperationMode, ResponseResolver,
    SyncEvent, SyncOperation, SyncState,
};
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A completed sync involving at least this many items is reported as a
/// major data change.
pub const MAJOR_CHANGE_THRESHOLD: usize = 15;

/// How a sync attempt is routed while another sync is in progress or the
/// database has not loaded yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncTimingStrategy {
    /// Enqueue; all queued callers resolve together after the currently
    /// executing sync ends.
    #[default]
    ResolveOnNext,
    /// Enqueue; after the current sync ends, a dedicated sync round is
    /// spawned for exactly one queued entry.
    ForceSpawnNew,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub check_integrity: bool,
    pub timing_strategy: SyncTimingStrategy,
}

#[derive(Default)]
struct EngineStatus {
    database_loaded: bool,
    in_progress: bool,
    last_pre_sync_save: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

pub struct SyncEngine<A: SyncApi, S: PersistentStore> {
    api: A,
    store: S,
    model: Arc<Mutex<ModelManager>>,
    keys: Arc<Mutex<KeyManager>>,
    protocol: ProtocolManager,
    events: EventRegistry,
    state: Mutex<SyncState>,
    status: Mutex<EngineStatus>,
    current_operation: Mutex<Option<SyncOperation>>,
    resolve_queue: Mutex<Vec<oneshot::Sender<()>>>,
    spawn_queue: Mutex<VecDeque<(SyncOptions, oneshot::Sender<()>)>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| CoreError::Lock(name.to_string()))
}

impl<A: SyncApi, S: PersistentStore> SyncEngine<A, S> {
    pub fn new(
        api: A,
        store: S,
        model: Arc<Mutex<ModelManager>>,
        keys: Arc<Mutex<KeyManager>>,
    ) -> Self {
        let protocol = ProtocolManager::new(keys.clone());
        Self {
            api,
            store,
            model,
            keys,
            protocol,
            events: EventRegistry::new(),
            state: Mutex::new(SyncState::new()),
            status: Mutex::new(EngineStatus::default()),
            current_operation: Mutex::new(None),
            resolve_queue: Mutex::new(Vec::new()),
            spawn_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn model(&self) -> Arc<Mutex<ModelManager>> {
        self.model.clone()
    }

    pub fn key_manager(&self) -> Arc<Mutex<KeyManager>> {
        self.keys.clone()
    }

    pub fn protocol(&self) -> &ProtocolManager {
        &self.protocol
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn database_loaded(&self) -> Result<bool> {
        Ok(lock(&self.status, "engine status")?.database_loaded)
    }

    pub fn is_out_of_sync(&self) -> Result<bool> {
        Ok(lock(&self.state, "sync state")?.out_of_sync())
    }

    pub fn last_error(&self) -> Result<Option<String>> {
        Ok(lock(&self.status, "engine status")?.last_error.clone())
    }

    /// Request cancellation of the running operation. Rejected mid-round;
    /// honored between rounds. Returns whether cancellation took effect.
    pub fn try_cancel(&self) -> Result<bool> {
        Ok(lock(&self.current_operation, "sync operation")?
            .as_mut()
            .map(SyncOperation::try_cancel)
            .unwrap_or(false))
    }

    // --- Database load ---

    /// Load every stored payload into the item graph. Payloads are sorted
    /// by content-type priority then `updated_at` descending, so items
    /// keys decrypt before the items they wrap.
    ///
    /// Panics if called twice; a double load is a programmer error.
    pub async fn load_database(&self) -> Result<()> {
        {
            let status = lock(&self.status, "engine status")?;
            if status.database_loaded {
                panic!("local database may only be loaded once");
            }
        }

        let mut raws = self.store.get_all_raw_payloads()?;
        raws.sort_by(|a, b| {
            let priority_a = ContentType::parse(&a.content_type).load_priority();
            let priority_b = ContentType::parse(&b.content_type).load_priority();
            priority_a
                .cmp(&priority_b)
                .then(b.updated_at.cmp(&a.updated_at))
        });
        info!(count = raws.len(), "loading local database");

        let payloads: Vec<Payload> = raws.iter().map(Payload::from_storage).collect();
        let decrypted = self.decrypt_in_key_order(payloads)?;
        lock(&self.model, "model manager")?
            .map_payloads_to_local_items(&decrypted, PayloadSource::LocalRetrieved);

        lock(&self.status, "engine status")?.database_loaded = true;
        self.events.notify(&SyncEvent::DatabaseLoaded)?;

        // Callers that attempted to sync before the load was finished are
        // waiting in the queues; serve them now.
        let queued = !lock(&self.resolve_queue, "resolve queue")?.is_empty()
            || !lock(&self.spawn_queue, "spawn queue")?.is_empty();
        if queued {
            self.sync(SyncOptions::default()).await?;
        }
        Ok(())
    }

    // --- Sync entry point ---

    /// Run a full multi-round sync. Concurrent attempts are serialized:
    /// while a sync is in progress (or before the database has loaded)
    /// the call is queued per its timing strategy and resolves when its
    /// round completes.
    pub async fn sync(&self, options: SyncOptions) -> Result<()> {
        let can_run = {
            let mut status = lock(&self.status, "engine status")?;
            if status.database_loaded && !status.in_progress {
                status.in_progress = true;
                true
            } else {
                false
            }
        };

        if !can_run {
            let receiver = match options.timing_strategy {
                SyncTimingStrategy::ResolveOnNext => {
                    let (tx, rx) = oneshot::channel();
                    lock(&self.resolve_queue, "resolve queue")?.push(tx);
                    rx
                }
                SyncTimingStrategy::ForceSpawnNew => {
                    let (tx, rx) = oneshot::channel();
                    lock(&self.spawn_queue, "spawn queue")?.push_back((options, tx));
                    rx
                }
            };
            let _ = receiver.await;
            return Ok(());
        }

        let result = self.run_sync_loop(options).await;
        lock(&self.status, "engine status")?.in_progress = false;
        result
    }

    async fn run_sync_loop(&self, options: SyncOptions) -> Result<()> {
        let mut current = options;
        let mut spawn_waiter: Option<oneshot::Sender<()>> = None;
        loop {
            // The resolve-queue snapshot is captured before the round
            // begins; callers enqueued during the round are deferred to
            // the next one.
            let resolvers: Vec<oneshot::Sender<()>> =
                mem::take(&mut *lock(&self.resolve_queue, "resolve queue")?);

            let result = self.perform_sync(current).await;

            for tx in resolvers {
                let _ = tx.send(());
            }
            if let Some(tx) = spawn_waiter.take() {
                let _ = tx.send(());
            }

            if let Err(error) = result {
                if let Ok(mut status) = self.status.lock() {
                    status.last_error = Some(error.to_string());
                }
                // Resolve everything still queued so no caller hangs; a
                // fresh sync() is the retry path.
                if let Ok(mut queue) = self.resolve_queue.lock() {
                    for tx in queue.drain(..) {
                        let _ = tx.send(());
                    }
                }
                if let Ok(mut queue) = self.spawn_queue.lock() {
                    for (_, tx) in queue.drain(..) {
                        let _ = tx.send(());
                    }
                }
                return Err(error);
            }

            if !lock(&self.resolve_queue, "resolve queue")?.is_empty() {
                current = SyncOptions::default();
                continue;
            }
            let next_spawn = lock(&self.spawn_queue, "spawn queue")?.pop_front();
            if let Some((spawn_options, tx)) = next_spawn {
                current = spawn_options;
                spawn_waiter = Some(tx);
                continue;
            }
            return Ok(());
        }
    }

    // --- One full sync operation ---

    async fn perform_sync(&self, options: SyncOptions) -> Result<()> {
        self.pre_sync_save()?;

        let upload_snapshots: Vec<Payload> = {
            let mut model = lock(&self.model, "model manager")?;
            let uuids: Vec<String> = model
                .dirty_items()
                .iter()
                .map(|item| item.uuid().to_string())
                .collect();
            model.mark_items_sync_began(&uuids);
            model
                .dirty_items()
                .iter()
                .map(|item| item.payload_representation(PayloadSource::LocalDirtied))
                .collect()
        };

        let mode = if lock(&self.keys, "key manager")?.has_root_key() {
            OperationMode::Account
        } else {
            OperationMode::Offline
        };
        let intent = match mode {
            OperationMode::Account => EncryptionIntent::Sync,
            OperationMode::Offline => EncryptionIntent::LocalStoragePreferEncrypted,
        };

        let mut encrypted = Vec::with_capacity(upload_snapshots.len());
        for payload in &upload_snapshots {
            // Tombstones carry no content to encrypt.
            if payload.content().is_none() {
                encrypted.push(payload.clone());
                continue;
            }
            encrypted.push(self.protocol.payload_by_encrypting_payload(payload, intent, None)?);
        }

        debug!(count = encrypted.len(), ?mode, "spawning sync operation");
        *lock(&self.current_operation, "sync operation")? =
            Some(SyncOperation::new(mode, encrypted, options.check_integrity));

        let rounds_result = self.run_operation_rounds().await;
        let items_involved = lock(&self.current_operation, "sync operation")?
            .take()
            .map(|op| op.items_involved())
            .unwrap_or(0);
        rounds_result?;

        if items_involved >= MAJOR_CHANGE_THRESHOLD {
            self.events.notify(&SyncEvent::MajorDataChange)?;
        }
        self.events.notify(&SyncEvent::FullSyncCompleted)?;
        Ok(())
    }

    async fn run_operation_rounds(&self) -> Result<()> {
        loop {
            let round = {
                let mut guard = lock(&self.current_operation, "sync operation")?;
                let op = guard.as_mut().expect("no operation in progress");
                if op.cancelled() {
                    None
                } else {
                    op.lock_cancelation();
                    let batch = op.pop_payloads();
                    op.record_items_involved(batch.len());
                    Some((batch, op.mode(), op.check_integrity(), op.saved_or_saving().to_vec()))
                }
            };
            let Some((batch, mode, check_integrity, saved_or_saving)) = round else {
                debug!("sync operation cancelled between rounds");
                return Ok(());
            };

            let (sync_token, cursor_token) = self.stored_tokens()?;

            let response = match mode {
                OperationMode::Account => {
                    let request = SyncRequest::new(
                        batch.iter().map(Payload::ejected).collect(),
                        sync_token,
                        cursor_token,
                        check_integrity,
                    );
                    match self.api.sync(&request).await {
                        Ok(response) => response,
                        Err(ApiError::InvalidSession) => {
                            self.unlock_operation()?;
                            warn!("server rejected session");
                            self.events.notify(&SyncEvent::InvalidSession)?;
                            return Err(ApiError::InvalidSession.into());
                        }
                        Err(error) => {
                            self.unlock_operation()?;
                            warn!(%error, "sync round failed");
                            self.events.notify(&SyncEvent::SyncError(error.to_string()))?;
                            return Err(error.into());
                        }
                    }
                }
                OperationMode::Offline => offline_saved_response(&batch),
            };

            let retrieved_count = response.retrieved_items.len();
            self.handle_response(&saved_or_saving, &response)?;

            let done = {
                let mut guard = lock(&self.current_operation, "sync operation")?;
                match guard.as_mut() {
                    Some(op) => {
                        op.record_items_involved(retrieved_count);
                        op.unlock_cancelation();
                        op.pending_upload_count() == 0 && response.cursor_token.is_none()
                    }
                    None => true,
                }
            };
            if done {
                return Ok(());
            }
        }
    }

    fn unlock_operation(&self) -> Result<()> {
        if let Some(op) = lock(&self.current_operation, "sync operation")?.as_mut() {
            op.unlock_cancelation();
        }
        Ok(())
    }

    // --- Response handling ---

    fn handle_response(&self, saved_or_saving: &[String], response: &SyncResponse) -> Result<()> {
        // Tokens first, so an interrupted mapping resumes from the right
        // cursor.
        if let Some(token) = &response.sync_token {
            self.store.set_value(LAST_SYNC_TOKEN_KEY, json!(token))?;
        }
        match &response.cursor_token {
            Some(cursor) => self.store.set_value(PAGINATION_TOKEN_KEY, json!(cursor))?,
            None => self.store.remove_value(PAGINATION_TOKEN_KEY)?,
        }

        let retrieved = self.decrypt_in_key_order(
            response
                .retrieved_items
                .iter()
                .map(|raw| Payload::from_server(raw, PayloadSource::RemoteRetrieved))
                .collect(),
        )?;
        let saved: Vec<Payload> = response
            .saved_items
            .iter()
            .map(|raw| Payload::from_server(raw, PayloadSource::RemoteSaved))
            .collect();
        let conflicts = self.decrypt_in_key_order(
            response
                .conflicts
                .iter()
                .map(|entry| Payload::from_server(&entry.server_item, PayloadSource::RemoteConflict))
                .collect(),
        )?;

        // The local base snapshot is taken at response time, before any
        // payload of this response is processed.
        let base = lock(&self.model, "model manager")?.payload_snapshot(PayloadSource::LocalRetrieved);
        let resolver =
            ResponseResolver::new(base, retrieved, saved, conflicts, saved_or_saving.to_vec());

        for (source, payloads) in resolver.resolved_collections() {
            if payloads.is_empty() {
                continue;
            }
            self.register_items_keys(&payloads)?;
            lock(&self.model, "model manager")?.map_payloads_to_local_items(&payloads, source);
            self.persist_payloads(&payloads)?;
        }

        self.retry_waiting_for_key_payloads()?;

        if let Some(server_hash) = &response.integrity_hash {
            self.check_integrity_against(server_hash)?;
        }
        Ok(())
    }

    /// Decrypt payloads preserving input order, but resolving items-key
    /// payloads first so sibling payloads wrapped by a just-arrived key
    /// decrypt in the same pass.
    fn decrypt_in_key_order(&self, payloads: Vec<Payload>) -> Result<Vec<Payload>> {
        let mut results: Vec<Option<Payload>> = vec![None; payloads.len()];
        for (position, payload) in payloads.iter().enumerate() {
            if *payload.content_type() == ContentType::ItemsKey {
                let decrypted = self.protocol.payload_by_decrypting_payload(payload, None)?;
                lock(&self.keys, "key manager")?.add_items_key_from_payload(&decrypted);
                results[position] = Some(decrypted);
            }
        }
        for (position, payload) in payloads.iter().enumerate() {
            if results[position].is_none() {
                results[position] =
                    Some(self.protocol.payload_by_decrypting_payload(payload, None)?);
            }
        }
        Ok(results.into_iter().flatten().collect())
    }

    fn register_items_keys(&self, payloads: &[Payload]) -> Result<()> {
        let mut keys = lock(&self.keys, "key manager")?;
        for payload in payloads {
            if *payload.content_type() == ContentType::ItemsKey && !payload.discardable() {
                keys.add_items_key_from_payload(payload);
            }
        }
        Ok(())
    }

    /// Re-attempt decryption of items that were waiting for a key, using
    /// their stored encrypted payloads.
    fn retry_waiting_for_key_payloads(&self) -> Result<()> {
        let waiting: Vec<String> = {
            let model = lock(&self.model, "model manager")?;
            model
                .all_items()
                .into_iter()
                .filter(|item| item.waiting_for_key())
                .map(|item| item.uuid().to_string())
                .collect()
        };
        if waiting.is_empty() {
            return Ok(());
        }

        let raws = self.store.get_all_raw_payloads()?;
        let pending: Vec<Payload> = raws
            .iter()
            .filter(|raw| waiting.contains(&raw.uuid))
            .map(Payload::from_storage)
            .collect();
        let decrypted = self.protocol.payloads_by_decrypting_payloads(&pending, false)?;
        let recovered: Vec<Payload> = decrypted
            .into_iter()
            .filter(|payload| !payload.waiting_for_key() && !payload.error_decrypting())
            .collect();
        if recovered.is_empty() {
            return Ok(());
        }

        debug!(count = recovered.len(), "decrypted payloads that were waiting for key");
        self.register_items_keys(&recovered)?;
        lock(&self.model, "model manager")?
            .map_payloads_to_local_items(&recovered, PayloadSource::LocalRetrieved);
        self.persist_payloads(&recovered)
    }

    fn check_integrity_against(&self, server_hash: &str) -> Result<()> {
        let timestamps = lock(&self.model, "model manager")?.integrity_timestamps();
        let client_hash = compute_integrity_hash(&timestamps);
        let matches = client_hash == server_hash;

        let outcome = lock(&self.state, "sync state")?.record_integrity_check(matches);
        match outcome {
            IntegrityOutcome::EnteredOutOfSync => {
                warn!("integrity discordance limit reached; entering out of sync");
                self.events.notify(&SyncEvent::EnterOutOfSync)?;
            }
            IntegrityOutcome::ExitedOutOfSync => {
                info!("integrity restored; exiting out of sync");
                self.events.notify(&SyncEvent::ExitOutOfSync)?;
            }
            IntegrityOutcome::InSync | IntegrityOutcome::Discordant => {}
        }
        Ok(())
    }

    // --- Persistence ---

    /// Persist dirty payloads that changed since the last pre-sync save,
    /// so local edits survive an interrupted upload.
    fn pre_sync_save(&self) -> Result<()> {
        let last_save = lock(&self.status, "engine status")?.last_pre_sync_save;
        let snapshots: Vec<Payload> = {
            let model = lock(&self.model, "model manager")?;
            model
                .dirty_items()
                .iter()
                .filter(|item| match (last_save, item.dirtied_date()) {
                    (Some(last), Some(dirtied)) => dirtied > last,
                    _ => true,
                })
                .map(|item| item.payload_representation(PayloadSource::LocalDirtied))
                .collect()
        };
        if !snapshots.is_empty() {
            debug!(count = snapshots.len(), "pre-sync save");
            self.persist_payloads(&snapshots)?;
        }
        lock(&self.status, "engine status")?.last_pre_sync_save = Some(Utc::now());
        Ok(())
    }

    /// Write payloads to the persistent store under the prefer-encrypted
    /// intent; discardable payloads are evicted instead.
    fn persist_payloads(&self, payloads: &[Payload]) -> Result<()> {
        let mut to_save = Vec::new();
        let mut to_delete = Vec::new();
        for payload in payloads {
            if payload.discardable() {
                to_delete.push(payload.uuid().to_string());
                continue;
            }
            let stored = if payload.format() == PayloadFormat::EncryptedString
                || payload.content().is_none()
            {
                payload.clone()
            } else {
                self.protocol.payload_by_encrypting_payload(
                    payload,
                    EncryptionIntent::LocalStoragePreferEncrypted,
                    None,
                )?
            };
            to_save.push(stored.ejected());
        }
        if !to_save.is_empty() {
            self.store.save_payloads(&to_save)?;
        }
        if !to_delete.is_empty() {
            self.store.delete_payloads(&to_delete)?;
        }
        Ok(())
    }

    fn stored_tokens(&self) -> Result<(Option<String>, Option<String>)> {
        let sync_token = self
            .store
            .get_value(LAST_SYNC_TOKEN_KEY)?
            .and_then(|value| value.as_str().map(str::to_string));
        let cursor_token = self
            .store
            .get_value(PAGINATION_TOKEN_KEY)?
            .and_then(|value| value.as_str().map(str::to_string));
        Ok((sync_token, cursor_token))
    }

    // --- Out-of-sync recovery ---

    /// Download every server payload, duplicate local divergences, adopt
    /// the server state, then run a normal sync with an integrity check.
    pub async fn resolve_out_of_sync(&self) -> Result<()> {
        info!("resolving out of sync; downloading all server payloads");

        let mut cursor: Option<String> = None;
        let mut downloaded: Vec<RawPayload> = Vec::new();
        loop {
            let request = SyncRequest::new(Vec::new(), None, cursor.clone(), false);
            let response = self.api.sync(&request).await?;
            downloaded.extend(response.retrieved_items);
            cursor = response.cursor_token;
            if cursor.is_none() {
                break;
            }
        }

        let payloads: Vec<Payload> = downloaded
            .iter()
            .map(|raw| Payload::from_server(raw, PayloadSource::RemoteRetrieved))
            .collect();
        let decrypted = self.decrypt_in_key_order(payloads)?;

        let base = lock(&self.model, "model manager")?.payload_snapshot(PayloadSource::LocalRetrieved);
        let apply = PayloadCollection::new(decrypted, PayloadSource::RemoteRetrieved);
        let resolved = delta_out_of_sync(&base, &apply);

        self.register_items_keys(&resolved)?;
        lock(&self.model, "model manager")?
            .map_payloads_to_local_items(&resolved, PayloadSource::RemoteRetrieved);
        self.persist_payloads(&resolved)?;

        self.sync(SyncOptions {
            check_integrity: true,
            timing_strategy: SyncTimingStrategy::ResolveOnNext,
        })
        .await
    }
}

/// Offline operations never reach the server; the "saved" acknowledgment
/// is synthesized locally with fresh timestamps.
fn offline_saved_response(batch: &[Payload]) -> SyncResponse {
    let now = Utc::now();
    SyncResponse {
        saved_items: batch
            .iter()
            .map(|payload| RawPayload {
                uuid: payload.uuid().to_string(),
                content_type: payload.content_type().as_str().to_string(),
                deleted: if payload.deleted() { Some(true) } else { None },
                created_at: payload.created_at().or(Some(now)),
                updated_at: Some(now),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}
