//! Identity resolution and merge-safe graph synchronization.
//!
//! Every contact and message endpoint is reduced to a canonical identity
//! before it touches the graph. The alias map and the seen-sets live on the
//! [`GraphSync`] value, which is constructed per ingestion run — sharing
//! either across runs (or requests) would bleed labels between archives.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::warn;

use crate::graph::{GraphStore, MessageEdge, PersonUpsert};
use crate::models::GraphStats;
use crate::normalize::{canonicalize_actor, compose_display_name};

/// The identity-bearing fields of a contact record.
#[derive(Debug, Clone, Default)]
pub struct ContactIdentity {
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

/// The identity-bearing fields of a message record.
#[derive(Debug, Clone)]
pub struct MessageIdentity {
    pub message_id: String,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub timestamp: Option<String>,
    pub body: Option<String>,
    pub conversation_id: Option<String>,
}

/// Run-scoped synchronizer: alias map, registration stats, and the
/// merge-safe upsert logic over a [`GraphStore`].
pub struct GraphSync<'a> {
    store: &'a dyn GraphStore,
    alias_map: HashMap<String, String>,
    pub stats: GraphStats,
    pub skipped_contacts: u64,
    pub skipped_messages: u64,
}

impl<'a> GraphSync<'a> {
    pub fn new(store: &'a dyn GraphStore) -> Self {
        Self {
            store,
            alias_map: HashMap::new(),
            stats: GraphStats::default(),
            skipped_contacts: 0,
            skipped_messages: 0,
        }
    }

    pub fn alias(&self, canonical_id: &str) -> Option<&str> {
        self.alias_map.get(canonical_id).map(String::as_str)
    }

    /// Register a contact's canonical identities.
    ///
    /// Phone and email are independent identities when both canonicalize;
    /// otherwise the composed or display name is the single fallback. The
    /// preferred label (display name, else composed name, else the first
    /// identity's raw form) seeds the alias map so later message endpoints
    /// pick up a human-readable label.
    pub async fn register_contact(&mut self, contact: &ContactIdentity, source: &str) {
        if !self.store.is_enabled() {
            return;
        }

        let mut identifiers: Vec<(String, String)> = Vec::new();
        for raw in [&contact.phone_number, &contact.email] {
            if let Some(canonical) = canonicalize_actor(raw.as_deref()) {
                let raw_form = raw.clone().unwrap_or_else(|| canonical.clone());
                identifiers.push((canonical, raw_form));
            }
        }
        if identifiers.is_empty() {
            let composed = contact.display_name.clone().or_else(|| {
                compose_display_name(contact.given_name.as_deref(), contact.family_name.as_deref())
            });
            if let Some(canonical) = canonicalize_actor(composed.as_deref()) {
                let raw_form = composed.unwrap_or_else(|| canonical.clone());
                identifiers.push((canonical, raw_form));
            }
        }
        if identifiers.is_empty() {
            self.skipped_contacts += 1;
            return;
        }

        let preferred_name = contact
            .display_name
            .clone()
            .or_else(|| {
                compose_display_name(contact.given_name.as_deref(), contact.family_name.as_deref())
            })
            .unwrap_or_else(|| identifiers[0].1.clone());

        for (canonical, raw) in identifiers {
            if self.stats.seen_contact_identifiers.contains(&canonical) {
                self.alias_map.insert(canonical, preferred_name.clone());
                continue;
            }

            let registered = self
                .store
                .register_person(&PersonUpsert {
                    identifier: canonical.clone(),
                    display_name: Some(preferred_name.clone()),
                    given_name: contact.given_name.clone(),
                    family_name: contact.family_name.clone(),
                    raw_identifier: raw,
                    source: source.to_string(),
                })
                .await;

            if registered {
                self.stats.seen_contact_identifiers.insert(canonical.clone());
                self.stats.contacts_registered += 1;
                self.alias_map.insert(canonical, preferred_name.clone());
            } else {
                self.skipped_contacts += 1;
            }
        }
    }

    /// Register the directed edge for one message. Skipped (and tallied)
    /// unless both endpoints canonicalize; a store failure is also tallied
    /// and never aborts the run.
    pub async fn register_message(&mut self, message: &MessageIdentity, source: &str) {
        if !self.store.is_enabled() {
            return;
        }

        let sender_id = canonicalize_actor(message.sender.as_deref());
        let receiver_id = canonicalize_actor(message.receiver.as_deref());
        let (Some(sender_id), Some(receiver_id)) = (sender_id, receiver_id) else {
            self.skipped_messages += 1;
            return;
        };

        let sender_label = self
            .alias_map
            .get(&sender_id)
            .cloned()
            .or_else(|| message.sender.clone())
            .unwrap_or_else(|| sender_id.clone());
        let receiver_label = self
            .alias_map
            .get(&receiver_id)
            .cloned()
            .or_else(|| message.receiver.clone())
            .unwrap_or_else(|| receiver_id.clone());

        let registered = self
            .store
            .register_message(&MessageEdge {
                message_id: message.message_id.clone(),
                sender_id: sender_id.clone(),
                receiver_id: receiver_id.clone(),
                timestamp: message.timestamp.clone(),
                body: message.body.clone(),
                conversation_id: message.conversation_id.clone(),
                sender_label: sender_label.clone(),
                receiver_label: receiver_label.clone(),
                source: source.to_string(),
            })
            .await;

        if registered {
            if self.stats.seen_message_ids.insert(message.message_id.clone()) {
                self.stats.relationships_registered += 1;
            }
            // Message-only actors learn their own label here.
            self.alias_map.insert(sender_id, sender_label);
            self.alias_map.insert(receiver_id, receiver_label);
        } else {
            self.skipped_messages += 1;
        }
    }
}

/// Outcome of a full-ledger graph replay.
#[derive(Debug, Default, Serialize)]
pub struct GraphResyncStats {
    pub cleared: bool,
    pub contacts_synced: u64,
    pub relationships_synced: u64,
    pub skipped_contacts: u64,
    pub skipped_messages: u64,
    pub detail: Option<String>,
}

impl GraphResyncStats {
    pub fn success(&self) -> bool {
        self.detail.is_none()
    }
}

/// Wipe the graph store.
pub async fn reset_graph(store: &dyn GraphStore) -> GraphResyncStats {
    let mut stats = GraphResyncStats::default();
    if !store.is_enabled() {
        stats.detail = Some("graph integration is disabled".to_string());
        return stats;
    }
    stats.cleared = store.clear_all().await;
    if !stats.cleared {
        stats.detail = Some("failed to clear graph store".to_string());
    }
    stats
}

/// Replay the whole ledger into the graph with a fresh run-scoped alias
/// map. Used after changing graph settings or clearing the store.
pub async fn resync_graph(
    pool: &SqlitePool,
    store: &dyn GraphStore,
    clear_first: bool,
) -> GraphResyncStats {
    let mut stats = GraphResyncStats::default();
    if !store.is_enabled() {
        stats.detail = Some("graph integration is disabled".to_string());
        return stats;
    }

    if clear_first {
        stats.cleared = store.clear_all().await;
        if !stats.cleared {
            stats.detail = Some("failed to clear graph store".to_string());
            return stats;
        }
    }

    match replay_ledger(pool, store).await {
        Ok(sync) => {
            stats.contacts_synced = sync.stats.contacts_registered;
            stats.relationships_synced = sync.stats.relationships_registered;
            stats.skipped_contacts = sync.skipped_contacts;
            stats.skipped_messages = sync.skipped_messages;
        }
        Err(e) => {
            warn!("graph resync failed: {e:#}");
            stats.detail = Some(e.to_string());
        }
    }
    stats
}

async fn replay_ledger<'a>(
    pool: &SqlitePool,
    store: &'a dyn GraphStore,
) -> Result<GraphSync<'a>> {
    let mut sync = GraphSync::new(store);

    let contacts: Vec<(
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    )> = sqlx::query_as(
        "SELECT display_name, given_name, family_name, phone_number, email, source FROM contacts",
    )
    .fetch_all(pool)
    .await?;
    for (display_name, given_name, family_name, phone_number, email, source) in contacts {
        let contact = ContactIdentity {
            display_name,
            given_name,
            family_name,
            phone_number,
            email,
        };
        sync.register_contact(&contact, source.as_deref().unwrap_or_default())
            .await;
    }

    let messages: Vec<(
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    )> = sqlx::query_as(
        "SELECT external_id, sender, receiver, timestamp, body, conversation_id, source \
         FROM messages",
    )
    .fetch_all(pool)
    .await?;
    for (external_id, sender, receiver, timestamp, body, conversation_id, source) in messages {
        let message = MessageIdentity {
            message_id: external_id.unwrap_or_default(),
            sender,
            receiver,
            timestamp,
            body,
            conversation_id,
        };
        sync.register_message(&message, source.as_deref().unwrap_or_default())
            .await;
    }

    Ok(sync)
}
