//! Delta algorithms: compute the resulting collection from (base, apply)
//! for each sync response category.
//!
//! Conflicts never merge content; the losing side becomes a duplicate item
//! under a fresh uuid, and every payload that referenced the original is
//! updated to reference the duplicate as well.

use crate::payload::{
    contents_equal, ContentReference, Payload, PayloadCollection, PayloadContent, PayloadOverride,
    PayloadSource,
};
use chrono::Utc;
use uuid::Uuid;

/// Duplicate `target` under a fresh uuid.
///
/// Returns the duplicate followed by derived copies of every payload in
/// `base` that referenced the original uuid, each gaining a reference to
/// the duplicate. When `is_conflict`, the duplicate's content records the
/// origin uuid in `duplicate_of`.
pub fn payloads_by_duplicating(
    target: &Payload,
    base: &PayloadCollection,
    is_conflict: bool,
) -> Vec<Payload> {
    let new_uuid = Uuid::new_v4().to_string();
    let now = Utc::now();

    let content = target.decrypted_content().map(|content| {
        let mut duplicated = content.clone();
        if is_conflict {
            duplicated.duplicate_of = Some(target.uuid().to_string());
        }
        PayloadContent::Decrypted(duplicated)
    });

    let duplicate = target.merged_with(&PayloadOverride {
        uuid: Some(new_uuid.clone()),
        content,
        dirty: Some(true),
        dirtied_date: Some(now),
        created_at: Some(now),
        source: Some(PayloadSource::Constructor),
        ..Default::default()
    });

    let mut results = vec![duplicate];
    for referencing in base.payloads_referencing(target.uuid()) {
        let Some(content) = referencing.decrypted_content() else {
            continue;
        };
        let mut updated = content.clone();
        updated.references.push(ContentReference {
            uuid: new_uuid.clone(),
            content_type: target.content_type().as_str().to_string(),
        });
        results.push(referencing.merged_with(&PayloadOverride {
            content: Some(PayloadContent::Decrypted(updated)),
            dirty: Some(true),
            dirtied_date: Some(now),
            ..Default::default()
        }));
    }
    results
}

/// Merge rules for payloads retrieved from the server.
///
/// `base` is the decrypted snapshot of local state taken before any
/// processing of this response. Incoming payloads whose uuid is among the
/// payloads saved or saving in the same round are skipped; the saved
/// category owns them.
pub fn delta_remote_retrieved(
    base: &PayloadCollection,
    apply: &PayloadCollection,
    saved_or_saving: &[String],
) -> Vec<Payload> {
    let mut results = Vec::with_capacity(apply.len());
    for incoming in apply.all() {
        if saved_or_saving.iter().any(|uuid| uuid == incoming.uuid()) {
            continue;
        }
        match base.find(incoming.uuid()) {
            Some(local) if local.dirty() => {
                let differs = !contents_equal(local.content(), incoming.content());
                results.push(incoming.clone());
                if differs {
                    results.extend(payloads_by_duplicating(local, base, true));
                }
            }
            _ => results.push(incoming.clone()),
        }
    }
    results
}

/// Merge rules for the server's acknowledgment of saved payloads.
///
/// Saved payloads lack a content field; local content is retained. The
/// local copy is marked clean unless it was re-dirtied after this sync
/// round began.
pub fn delta_remote_saved(base: &PayloadCollection, apply: &PayloadCollection) -> Vec<Payload> {
    let now = Utc::now();
    let mut results = Vec::with_capacity(apply.len());
    for saved in apply.all() {
        let stays_dirty = base
            .find(saved.uuid())
            .map(|local| match (local.dirtied_date(), local.last_sync_began()) {
                (Some(dirtied), Some(began)) => local.dirty() && dirtied > began,
                _ => false,
            })
            .unwrap_or(false);

        let merged = match base.find(saved.uuid()) {
            Some(local) => local.merged_with(&PayloadOverride {
                deleted: Some(saved.deleted()),
                dirty: Some(stays_dirty),
                created_at: saved.created_at(),
                updated_at: saved.updated_at(),
                last_sync_end: Some(now),
                source: Some(PayloadSource::RemoteSaved),
                ..Default::default()
            }),
            None => saved.merged_with(&PayloadOverride {
                dirty: Some(false),
                last_sync_end: Some(now),
                source: Some(PayloadSource::RemoteSaved),
                ..Default::default()
            }),
        };
        results.push(merged);
    }
    results
}

/// Merge rules for server-reported conflicts: a client uuid collided with
/// a differing server record. The local version survives as a new-uuid
/// duplicate; the server version is adopted under the original uuid.
pub fn delta_remote_conflict(base: &PayloadCollection, apply: &PayloadCollection) -> Vec<Payload> {
    let mut results = Vec::new();
    for server_item in apply.all() {
        match base.find(server_item.uuid()) {
            Some(local) => {
                if !contents_equal(local.content(), server_item.content()) {
                    results.extend(payloads_by_duplicating(local, base, true));
                }
                results.push(server_item.merged_with(&PayloadOverride {
                    dirty: Some(false),
                    source: Some(PayloadSource::RemoteConflict),
                    ..Default::default()
                }));
            }
            None => results.push(server_item.clone()),
        }
    }
    results
}

/// Merge rules for out-of-sync reconciliation: for every divergent uuid,
/// the local payload survives as a new-uuid duplicate, then remote
/// overwrites local.
pub fn delta_out_of_sync(base: &PayloadCollection, apply: &PayloadCollection) -> Vec<Payload> {
    let mut results = Vec::new();
    for incoming in apply.all() {
        if let Some(local) = base.find(incoming.uuid()) {
            let differs = !contents_equal(local.content(), incoming.content());
            if differs && !local.deleted() && local.content().is_some() {
                results.extend(payloads_by_duplicating(local, base, true));
            }
        }
        results.push(incoming.clone());
    }
    results
}
