// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content-addressed caching of finished calculations.
//!
//! When enabled, a starting calculation first computes a content hash over
//! its class identity and non-metadata inputs. If a sealed, successfully
//! finished node with the same hash exists, the new process short-circuits:
//! its output links point at the very same data nodes as the source, and
//! an extra records which node it was cloned from. Candidates are taken in
//! ascending pk order, so the oldest equivalent node always wins and
//! repeated lookups are deterministic.
//!
//! Only calculation-flavored processes participate. Workflows are never
//! cached: replaying them from a cache would skip the sub-processes their
//! provenance is made of.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::debug;

use provena_store::{EntityStore, NodeRecord, Pk};

use crate::error::Result;
use crate::exit_code::ExitCode;
use crate::persister::Checkpoint;
use crate::process::{attrs, extras, stored_exit_code, stored_state};
use crate::registry::ProcessDefinition;
use crate::state::ProcessState;

/// Hex-encoded sha256 of a JSON value's canonical serialization.
///
/// Object keys serialize in sorted order, so semantically equal values
/// hash identically regardless of construction order.
pub fn content_hash(value: &Value) -> String {
    let canonical = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The cache identity of a process: class identifier, class version, and
/// every non-metadata input value.
pub fn process_hash(definition: &ProcessDefinition, checkpoint: &Checkpoint) -> String {
    let inputs = checkpoint.validated_inputs().provenance_values();
    content_hash(&json!({
        "class": definition.identifier,
        "version": definition.version,
        "inputs": inputs,
    }))
}

/// Find the cache source for a hash: the lowest-pk sealed node that
/// finished successfully, did not invalidate the cache, and has not been
/// marked invalid via its extras.
pub async fn find_cache_source(
    store: &dyn EntityStore,
    hash: &str,
) -> Result<Option<NodeRecord>> {
    for pk in store.find_by_extra(extras::HASH, &json!(hash)).await? {
        let node = store.load_node(pk).await?;
        if !node.sealed {
            continue;
        }
        if stored_state(store, pk).await? != Some(ProcessState::Finished) {
            continue;
        }
        match stored_exit_code(store, pk).await? {
            Some(exit) if exit.is_success() && !exit.invalidates_cache => {}
            _ => continue,
        }
        // An explicit `false` opts the node out; absent means valid.
        if node
            .extra(extras::VALID_CACHE)
            .is_some_and(|value| value == &json!(false))
        {
            continue;
        }
        debug!(source = pk, hash, "cache source found");
        return Ok(Some(node));
    }
    Ok(None)
}

/// Replay a cache hit: link `target`'s outputs to the same data nodes as
/// `source`, copy the exit attributes, and record the clone origin. The
/// caller publishes the terminal state and seals afterwards.
pub async fn apply_cache_hit(
    store: &dyn EntityStore,
    source: &NodeRecord,
    target: Pk,
    hash: &str,
) -> Result<ExitCode> {
    for link in store.outgoing(source.pk, None).await? {
        if link.link_type.is_output() {
            store
                .add_link(target, link.target, link.link_type, &link.label)
                .await?;
        }
    }

    let exit = stored_exit_code(store, source.pk).await?.unwrap_or(ExitCode::OK);
    store
        .set_attribute(target, attrs::EXIT_STATUS, json!(exit.status))
        .await?;
    if let Some(message) = &exit.message {
        store
            .set_attribute(target, attrs::EXIT_MESSAGE, json!(message))
            .await?;
    }

    store.set_extra(target, extras::HASH, json!(hash)).await?;
    store
        .set_extra(
            target,
            extras::CACHED_FROM,
            json!(source.uuid.to_string()),
        )
        .await?;

    debug!(source = source.pk, target, "cache hit applied");
    Ok(exit)
}
