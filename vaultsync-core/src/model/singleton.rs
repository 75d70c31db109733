//! Singleton enforcement for content types flagged single-instance.

use crate::model::{Item, ModelManager};
use crate::payload::{Payload, PayloadOverride, PayloadSource};
use chrono::Utc;
use tracing::debug;

/// Return the unique valid candidate matching `predicate`, enforcing
/// uniqueness along the way.
///
/// When multiple candidates match, the earliest-created survives and
/// every other candidate is marked `deleted` and `dirty` so the deletions
/// sync. When only error-decrypting candidates exist, or none at all, a
/// fresh payload from `create_payload` is mapped in and its uuid returned.
pub fn find_or_create_singleton(
    model: &mut ModelManager,
    predicate: impl Fn(&Item) -> bool,
    create_payload: impl FnOnce() -> Payload,
) -> String {
    let mut candidates: Vec<(String, Option<chrono::DateTime<Utc>>, bool)> = model
        .all_items()
        .into_iter()
        .filter(|item| !item.is_dummy() && !item.deleted() && predicate(item))
        .map(|item| {
            (
                item.uuid().to_string(),
                item.created_at(),
                item.error_decrypting(),
            )
        })
        .collect();

    candidates.sort_by_key(|(_, created_at, _)| *created_at);

    let valid: Vec<&(String, Option<chrono::DateTime<Utc>>, bool)> = candidates
        .iter()
        .filter(|(_, _, error_decrypting)| !error_decrypting)
        .collect();

    if let Some((survivor, _, _)) = valid.first() {
        let survivor = survivor.clone();
        let losers: Vec<String> = valid
            .iter()
            .skip(1)
            .map(|(uuid, _, _)| uuid.clone())
            .collect();
        if !losers.is_empty() {
            debug!(survivor = %survivor, count = losers.len(), "resolving singleton duplicates");
            let tombstones: Vec<Payload> = losers
                .iter()
                .filter_map(|uuid| model.find(uuid))
                .map(|item| {
                    item.payload_representation(PayloadSource::LocalDirtied)
                        .merged_with(&PayloadOverride {
                            deleted: Some(true),
                            dirty: Some(true),
                            dirtied_date: Some(Utc::now()),
                            ..Default::default()
                        })
                })
                .collect();
            model.map_payloads_to_local_items(&tombstones, PayloadSource::LocalDirtied);
        }
        return survivor;
    }

    // Only undecryptable candidates (or none): create a fresh instance.
    let payload = create_payload().merged_with(&PayloadOverride {
        dirty: Some(true),
        dirtied_date: Some(Utc::now()),
        ..Default::default()
    });
    let uuid = payload.uuid().to_string();
    model.map_payloads_to_local_items(&[payload], PayloadSource::LocalDirtied);
    uuid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ContentType, PayloadSource, RawPayload};
    use chrono::DateTime;
    use serde_json::json;

    fn privileges(uuid: &str, created_secs: i64) -> Payload {
        Payload::from_server(
            &RawPayload {
                uuid: uuid.to_string(),
                content_type: "SN|Privileges".to_string(),
                content: Some(json!({ "references": [] })),
                created_at: DateTime::from_timestamp(created_secs, 0),
                ..Default::default()
            },
            PayloadSource::RemoteRetrieved,
        )
    }

    fn is_privileges(item: &Item) -> bool {
        *item.content_type() == ContentType::Privileges
    }

    #[test]
    fn earliest_candidate_survives() {
        let mut model = ModelManager::new();
        model.map_payloads_to_local_items(
            &[
                privileges("p-late", 2_000),
                privileges("p-early", 1_000),
                privileges("p-mid", 1_500),
            ],
            PayloadSource::RemoteRetrieved,
        );

        let survivor =
            find_or_create_singleton(&mut model, is_privileges, || privileges("p-new", 0));
        assert_eq!(survivor, "p-early");

        let remaining: Vec<_> = model
            .items_of_type(&ContentType::Privileges)
            .into_iter()
            .filter(|item| !item.deleted())
            .collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].uuid(), "p-early");

        // Losers are tombstoned and pending sync.
        for uuid in ["p-late", "p-mid"] {
            let loser = model.find(uuid).unwrap();
            assert!(loser.deleted());
            assert!(loser.dirty());
        }
    }

    #[test]
    fn creates_when_no_candidate_exists() {
        let mut model = ModelManager::new();
        let uuid = find_or_create_singleton(&mut model, is_privileges, || privileges("p-new", 0));

        assert_eq!(uuid, "p-new");
        assert!(model.find("p-new").unwrap().dirty());
    }

    #[test]
    fn creates_when_only_undecryptable_candidates_exist() {
        let mut model = ModelManager::new();
        let broken = privileges("p-broken", 1_000).with_decrypted_parameters(None, true, false);
        model.map_payloads_to_local_items(&[broken], PayloadSource::LocalRetrieved);

        let uuid = find_or_create_singleton(&mut model, is_privileges, || privileges("p-new", 0));
        assert_eq!(uuid, "p-new");
    }

    #[test]
    fn idempotent_when_already_unique() {
        let mut model = ModelManager::new();
        model.map_payloads_to_local_items(&[privileges("p-1", 1_000)], PayloadSource::RemoteRetrieved);

        let first = find_or_create_singleton(&mut model, is_privileges, || privileges("p-x", 0));
        let second = find_or_create_singleton(&mut model, is_privileges, || privileges("p-y", 0));

        assert_eq!(first, "p-1");
        assert_eq!(second, "p-1");
    }
}
