//! Graph store collaborator: person nodes and directed MESSAGED edges.
//!
//! All writes are merges. A person is keyed by canonical identity; identity
//! attributes follow first-non-trivial-value-wins, while `last_seen_source`
//! always reflects the latest write. A relationship is keyed by
//! `(sender, receiver, message_id)`, so re-registering the same message only
//! refreshes edge attributes. [`Neo4jGraphStore`] speaks the transactional
//! Cypher HTTP endpoint; [`MemoryGraphStore`] carries the same merge
//! semantics in process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::config::GraphConfig;

/// Person attributes for a merge-safe upsert.
#[derive(Debug, Clone)]
pub struct PersonUpsert {
    pub identifier: String,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub raw_identifier: String,
    pub source: String,
}

/// One directed communication edge derived from a message.
#[derive(Debug, Clone)]
pub struct MessageEdge {
    pub message_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub timestamp: Option<String>,
    pub body: Option<String>,
    pub conversation_id: Option<String>,
    pub sender_label: String,
    pub receiver_label: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub group: String,
    pub title: Option<String>,
    pub focus: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub label: Option<String>,
}

/// Neighborhood view around every person matching a search term.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PersonGraph {
    pub focus: Vec<String>,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Delete every node and relationship. Returns false on failure.
    async fn clear_all(&self) -> bool;

    /// Merge a person node. Returns false when the write failed or the
    /// store is disabled; failures never propagate to the caller.
    async fn register_person(&self, person: &PersonUpsert) -> bool;

    /// Merge a MESSAGED edge (and its endpoint nodes). Returns false on
    /// failure or when the store is disabled.
    async fn register_message(&self, edge: &MessageEdge) -> bool;

    /// Read path for the visualization layer: every person matching `term`
    /// plus their direct communication partners.
    async fn fetch_person_graph(&self, term: &str, limit: usize) -> Result<PersonGraph>;
}

/// Placeholder used when the graph integration is turned off.
pub struct DisabledGraphStore;

#[async_trait]
impl GraphStore for DisabledGraphStore {
    fn is_enabled(&self) -> bool {
        false
    }
    async fn clear_all(&self) -> bool {
        false
    }
    async fn register_person(&self, _person: &PersonUpsert) -> bool {
        false
    }
    async fn register_message(&self, _edge: &MessageEdge) -> bool {
        false
    }
    async fn fetch_person_graph(&self, _term: &str, _limit: usize) -> Result<PersonGraph> {
        Ok(PersonGraph::default())
    }
}

/// Neo4j client over the transactional Cypher HTTP endpoint.
pub struct Neo4jGraphStore {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
    enabled: bool,
}

impl Neo4jGraphStore {
    /// Connect and ensure the person-id uniqueness constraint. A failed
    /// connection disables the store for this process instead of failing
    /// startup; ingestion then records graph sync as skipped.
    pub async fn connect(config: &GraphConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        let mut store = Self {
            client,
            endpoint: format!(
                "{}/db/{}/tx/commit",
                config.url.trim_end_matches('/'),
                config.database
            ),
            user: config.user.clone(),
            password: config.password.clone(),
            enabled: config.enabled,
        };

        if !store.enabled {
            return store;
        }

        if let Err(e) = store
            .run(
                "CREATE CONSTRAINT person_id_unique IF NOT EXISTS \
                 FOR (p:Person) REQUIRE p.id IS UNIQUE",
                json!({}),
            )
            .await
        {
            warn!("graph store unavailable, disabling for this process: {e:#}");
            store.enabled = false;
        }
        store
    }

    async fn run(&self, statement: &str, parameters: Value) -> Result<Vec<Vec<Value>>> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({
                "statements": [{"statement": statement, "parameters": parameters}]
            }))
            .send()
            .await
            .context("graph request failed")?
            .error_for_status()
            .context("graph store rejected request")?;

        let body: Value = response.json().await?;
        if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                bail!("graph store returned errors: {errors:?}");
            }
        }

        let rows = body
            .get("results")
            .and_then(|r| r.as_array())
            .and_then(|r| r.first())
            .and_then(|r| r.get("data"))
            .and_then(|d| d.as_array())
            .map(|data| {
                data.iter()
                    .filter_map(|entry| entry.get("row").and_then(|r| r.as_array()).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn clear_all(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.run("MATCH (n) DETACH DELETE n", json!({})).await {
            Ok(_) => true,
            Err(e) => {
                error!("failed to clear graph: {e:#}");
                false
            }
        }
    }

    async fn register_person(&self, person: &PersonUpsert) -> bool {
        if !self.enabled || person.identifier.is_empty() {
            return false;
        }

        let statement = r#"
            MERGE (p:Person {id: $id})
            SET p.raw_identifier = coalesce(p.raw_identifier, $raw_identifier),
                p.last_seen_source = $source
            SET p.display_name = CASE
                    WHEN $display_name IS NOT NULL AND (p.display_name IS NULL OR p.display_name = '')
                    THEN $display_name ELSE p.display_name END,
                p.given_name = CASE
                    WHEN $given_name IS NOT NULL AND (p.given_name IS NULL OR p.given_name = '')
                    THEN $given_name ELSE p.given_name END,
                p.family_name = CASE
                    WHEN $family_name IS NOT NULL AND (p.family_name IS NULL OR p.family_name = '')
                    THEN $family_name ELSE p.family_name END
        "#;
        let parameters = json!({
            "id": person.identifier,
            "display_name": person.display_name,
            "given_name": person.given_name,
            "family_name": person.family_name,
            "raw_identifier": person.raw_identifier,
            "source": person.source,
        });

        match self.run(statement, parameters).await {
            Ok(_) => true,
            Err(e) => {
                error!(identifier = %person.identifier, "failed to register person: {e:#}");
                false
            }
        }
    }

    async fn register_message(&self, edge: &MessageEdge) -> bool {
        if !self.enabled
            || edge.message_id.is_empty()
            || edge.sender_id.is_empty()
            || edge.receiver_id.is_empty()
        {
            return false;
        }

        let statement = r#"
            MERGE (sender:Person {id: $sender_id})
            SET sender.display_name = CASE
                    WHEN sender.display_name IS NULL THEN $sender_label
                    ELSE sender.display_name END,
                sender.last_seen_source = $source
            MERGE (receiver:Person {id: $receiver_id})
            SET receiver.display_name = CASE
                    WHEN receiver.display_name IS NULL THEN $receiver_label
                    ELSE receiver.display_name END,
                receiver.last_seen_source = $source
            MERGE (sender)-[rel:MESSAGED {message_id: $message_id}]->(receiver)
            SET rel.timestamp = $timestamp,
                rel.body = $body,
                rel.conversation_id = $conversation_id,
                rel.source = $source
        "#;
        let parameters = json!({
            "message_id": edge.message_id,
            "sender_id": edge.sender_id,
            "receiver_id": edge.receiver_id,
            "timestamp": edge.timestamp,
            "body": edge.body,
            "conversation_id": edge.conversation_id,
            "sender_label": edge.sender_label,
            "receiver_label": edge.receiver_label,
            "source": edge.source,
        });

        match self.run(statement, parameters).await {
            Ok(_) => true,
            Err(e) => {
                error!(message_id = %edge.message_id, "failed to register message: {e:#}");
                false
            }
        }
    }

    async fn fetch_person_graph(&self, term: &str, limit: usize) -> Result<PersonGraph> {
        if !self.enabled || term.trim().is_empty() {
            return Ok(PersonGraph::default());
        }
        let term_lower = term.trim().to_lowercase();

        let centers = self
            .run(
                "MATCH (p:Person) \
                 WHERE toLower(p.id) CONTAINS $term \
                    OR toLower(coalesce(p.display_name, '')) CONTAINS $term \
                 RETURN DISTINCT p.id, p.display_name, p.raw_identifier",
                json!({"term": term_lower}),
            )
            .await?;
        if centers.is_empty() {
            return Ok(PersonGraph::default());
        }

        let mut graph = PersonGraph::default();
        let mut node_ids = std::collections::HashSet::new();
        let center_ids: Vec<String> = centers
            .iter()
            .filter_map(|row| row.first().and_then(|v| v.as_str()).map(str::to_string))
            .collect();

        for row in &centers {
            let id = match row.first().and_then(|v| v.as_str()) {
                Some(id) => id.to_string(),
                None => continue,
            };
            let display = row.get(1).and_then(|v| v.as_str());
            let raw = row.get(2).and_then(|v| v.as_str());
            if node_ids.insert(id.clone()) {
                graph.focus.push(id.clone());
                graph.nodes.push(GraphNode {
                    label: display.or(raw).unwrap_or(&id).to_string(),
                    title: raw.map(str::to_string),
                    group: "person".to_string(),
                    focus: true,
                    id,
                });
            }
        }

        let relationships = self
            .run(
                "MATCH (sender:Person)-[rel:MESSAGED]->(receiver:Person) \
                 WHERE sender.id IN $center_ids OR receiver.id IN $center_ids \
                 RETURN sender.id, receiver.id, rel.message_id, rel.timestamp, \
                        sender.display_name, receiver.display_name, \
                        sender.raw_identifier, receiver.raw_identifier \
                 LIMIT $limit",
                json!({"center_ids": center_ids, "limit": limit}),
            )
            .await?;

        for row in relationships {
            let source = row.first().and_then(|v| v.as_str()).unwrap_or_default();
            let target = row.get(1).and_then(|v| v.as_str()).unwrap_or_default();
            if source.is_empty() || target.is_empty() {
                continue;
            }
            for (id, display, raw) in [(source, 4usize, 6usize), (target, 5, 7)]
                .map(|(id, d, r)| {
                    (
                        id,
                        row.get(d).and_then(|v| v.as_str()),
                        row.get(r).and_then(|v| v.as_str()),
                    )
                })
            {
                if node_ids.insert(id.to_string()) {
                    graph.nodes.push(GraphNode {
                        id: id.to_string(),
                        label: display.or(raw).unwrap_or(id).to_string(),
                        group: "person".to_string(),
                        title: raw.map(str::to_string),
                        focus: false,
                    });
                }
            }
            let message_id = row
                .get(2)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{source}->{target}"));
            graph.edges.push(GraphEdge {
                id: message_id,
                source: source.to_string(),
                target: target.to_string(),
                label: row.get(3).and_then(|v| v.as_str()).map(str::to_string),
            });
        }

        Ok(graph)
    }
}

#[derive(Debug, Clone, Default)]
struct PersonNode {
    display_name: Option<String>,
    #[allow(dead_code)]
    given_name: Option<String>,
    #[allow(dead_code)]
    family_name: Option<String>,
    raw_identifier: Option<String>,
    #[allow(dead_code)]
    last_seen_source: Option<String>,
}

#[derive(Debug, Clone)]
struct EdgeAttrs {
    timestamp: Option<String>,
    #[allow(dead_code)]
    body: Option<String>,
    #[allow(dead_code)]
    conversation_id: Option<String>,
    #[allow(dead_code)]
    source: String,
}

#[derive(Default)]
struct MemoryGraphInner {
    persons: HashMap<String, PersonNode>,
    edges: HashMap<(String, String, String), EdgeAttrs>,
}

/// In-process graph store with the same merge semantics as the Neo4j
/// implementation. Backs tests and offline runs.
#[derive(Default)]
pub struct MemoryGraphStore {
    inner: Mutex<MemoryGraphInner>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn person_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").persons.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").edges.len()
    }

    pub fn display_name(&self, identifier: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .persons
            .get(identifier)
            .and_then(|p| p.display_name.clone())
    }

    fn merge_person(inner: &mut MemoryGraphInner, person: &PersonUpsert) {
        let node = inner.persons.entry(person.identifier.clone()).or_default();
        if node.raw_identifier.is_none() {
            node.raw_identifier = Some(person.raw_identifier.clone());
        }
        merge_attribute(&mut node.display_name, person.display_name.as_deref());
        merge_attribute(&mut node.given_name, person.given_name.as_deref());
        merge_attribute(&mut node.family_name, person.family_name.as_deref());
        node.last_seen_source = Some(person.source.clone());
    }
}

/// First non-empty value wins; later writes never overwrite.
fn merge_attribute(current: &mut Option<String>, incoming: Option<&str>) {
    let is_trivial = current.as_deref().map_or(true, str::is_empty);
    if is_trivial {
        if let Some(value) = incoming {
            *current = Some(value.to_string());
        }
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn clear_all(&self) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.persons.clear();
        inner.edges.clear();
        true
    }

    async fn register_person(&self, person: &PersonUpsert) -> bool {
        if person.identifier.is_empty() {
            return false;
        }
        let mut inner = self.inner.lock().expect("lock poisoned");
        Self::merge_person(&mut inner, person);
        true
    }

    async fn register_message(&self, edge: &MessageEdge) -> bool {
        if edge.message_id.is_empty() || edge.sender_id.is_empty() || edge.receiver_id.is_empty() {
            return false;
        }
        let mut inner = self.inner.lock().expect("lock poisoned");

        for (id, label) in [
            (&edge.sender_id, &edge.sender_label),
            (&edge.receiver_id, &edge.receiver_label),
        ] {
            let node = inner.persons.entry(id.clone()).or_default();
            if node.display_name.is_none() {
                node.display_name = Some(label.clone());
            }
            node.last_seen_source = Some(edge.source.clone());
        }

        inner.edges.insert(
            (
                edge.sender_id.clone(),
                edge.receiver_id.clone(),
                edge.message_id.clone(),
            ),
            EdgeAttrs {
                timestamp: edge.timestamp.clone(),
                body: edge.body.clone(),
                conversation_id: edge.conversation_id.clone(),
                source: edge.source.clone(),
            },
        );
        true
    }

    async fn fetch_person_graph(&self, term: &str, limit: usize) -> Result<PersonGraph> {
        let term_lower = term.trim().to_lowercase();
        if term_lower.is_empty() {
            return Ok(PersonGraph::default());
        }
        let inner = self.inner.lock().expect("lock poisoned");

        let mut graph = PersonGraph::default();
        let mut node_ids = std::collections::HashSet::new();
        for (id, node) in &inner.persons {
            let display = node.display_name.as_deref().unwrap_or_default();
            if id.to_lowercase().contains(&term_lower)
                || display.to_lowercase().contains(&term_lower)
            {
                graph.focus.push(id.clone());
                node_ids.insert(id.clone());
                graph.nodes.push(node_for(id, node, true));
            }
        }

        for ((sender, receiver, message_id), attrs) in inner.edges.iter().take(limit) {
            if !graph.focus.contains(sender) && !graph.focus.contains(receiver) {
                continue;
            }
            for id in [sender, receiver] {
                if node_ids.insert(id.clone()) {
                    let node = inner.persons.get(id).cloned().unwrap_or_default();
                    graph.nodes.push(node_for(id, &node, false));
                }
            }
            graph.edges.push(GraphEdge {
                id: message_id.clone(),
                source: sender.clone(),
                target: receiver.clone(),
                label: attrs.timestamp.clone(),
            });
        }
        Ok(graph)
    }
}

fn node_for(id: &str, node: &PersonNode, focus: bool) -> GraphNode {
    GraphNode {
        id: id.to_string(),
        label: node
            .display_name
            .clone()
            .or_else(|| node.raw_identifier.clone())
            .unwrap_or_else(|| id.to_string()),
        group: "person".to_string(),
        title: node.raw_identifier.clone(),
        focus,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(id: &str, display: Option<&str>) -> PersonUpsert {
        PersonUpsert {
            identifier: id.to_string(),
            display_name: display.map(str::to_string),
            given_name: None,
            family_name: None,
            raw_identifier: id.to_string(),
            source: "test.db".to_string(),
        }
    }

    #[tokio::test]
    async fn first_display_name_wins() {
        let store = MemoryGraphStore::new();
        assert!(store.register_person(&person("+15551230001", Some("Jane Smith"))).await);
        assert!(store.register_person(&person("+15551230001", None)).await);
        assert!(store.register_person(&person("+15551230001", Some("J. Smith"))).await);

        assert_eq!(store.person_count(), 1);
        assert_eq!(store.display_name("+15551230001").as_deref(), Some("Jane Smith"));
    }

    #[tokio::test]
    async fn empty_display_name_is_trivial_and_replaceable() {
        let store = MemoryGraphStore::new();
        store.register_person(&person("a@b.c", Some(""))).await;
        store.register_person(&person("a@b.c", Some("Alice"))).await;
        assert_eq!(store.display_name("a@b.c").as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn message_merge_is_keyed_by_triple() {
        let store = MemoryGraphStore::new();
        let edge = MessageEdge {
            message_id: "sms.db:sms:1".to_string(),
            sender_id: "+1".to_string(),
            receiver_id: "+2".to_string(),
            timestamp: Some("2024-01-01T00:00:00+00:00".to_string()),
            body: Some("hello".to_string()),
            conversation_id: None,
            sender_label: "+1".to_string(),
            receiver_label: "+2".to_string(),
            source: "sms.db".to_string(),
        };
        assert!(store.register_message(&edge).await);
        assert!(store.register_message(&edge).await);
        assert_eq!(store.relationship_count(), 1);
        assert_eq!(store.person_count(), 2);
    }

    #[tokio::test]
    async fn fetch_person_graph_finds_neighbors() {
        let store = MemoryGraphStore::new();
        store.register_person(&person("+1", Some("Jane Smith"))).await;
        let edge = MessageEdge {
            message_id: "m1".to_string(),
            sender_id: "+1".to_string(),
            receiver_id: "+2".to_string(),
            timestamp: None,
            body: None,
            conversation_id: None,
            sender_label: "Jane Smith".to_string(),
            receiver_label: "+2".to_string(),
            source: "sms.db".to_string(),
        };
        store.register_message(&edge).await;

        let graph = store.fetch_person_graph("jane", 10).await.unwrap();
        assert_eq!(graph.focus, vec!["+1".to_string()]);
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
    }
}
