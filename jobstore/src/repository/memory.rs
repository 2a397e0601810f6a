// In-memory document repository
//
// Shares one document map between every clone, so several simulated nodes
// can coordinate through it exactly as they would through a remote store.

use super::{Collection, ConcurrencyToken, Document, DocumentRepository, Query};
use crate::errors::RepositoryError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

type DocumentId = (String, Collection, String);

#[derive(Default)]
struct Shared {
    documents: Mutex<HashMap<DocumentId, (Value, ConcurrencyToken)>>,
    offline: AtomicBool,
}

/// Fakeable repository variant backed by a process-local map
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    shared: Arc<Shared>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) connectivity to the store
    pub fn set_online(&self, online: bool) {
        self.shared.offline.store(!online, Ordering::SeqCst);
    }

    /// Number of documents currently held in one collection
    pub fn count(&self, partition: &str, collection: Collection) -> usize {
        lock_documents(&self.shared)
            .keys()
            .filter(|(p, c, _)| p == partition && *c == collection)
            .count()
    }

    fn check_online(&self) -> Result<(), RepositoryError> {
        check_online(&self.shared)
    }
}

fn check_online(shared: &Shared) -> Result<(), RepositoryError> {
    if shared.offline.load(Ordering::SeqCst) {
        Err(RepositoryError::StoreUnavailable(
            "in-memory store is offline".to_string(),
        ))
    } else {
        Ok(())
    }
}

fn lock_documents(shared: &Shared) -> MutexGuard<'_, HashMap<DocumentId, (Value, ConcurrencyToken)>> {
    // a panic while holding the guard cannot leave a half-written entry behind
    shared
        .documents
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn doc_id(partition: &str, collection: Collection, id: &str) -> DocumentId {
    (partition.to_string(), collection, id.to_string())
}

fn new_token() -> ConcurrencyToken {
    ConcurrencyToken::new(Uuid::new_v4().to_string())
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentStore {
    async fn get(
        &self,
        partition: &str,
        collection: Collection,
        id: &str,
    ) -> Result<Document, RepositoryError> {
        self.check_online()?;
        let documents = lock_documents(&self.shared);
        match documents.get(&doc_id(partition, collection, id)) {
            Some((body, token)) => Ok(Document {
                id: id.to_string(),
                body: body.clone(),
                token: token.clone(),
            }),
            None => Err(RepositoryError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn upsert(
        &self,
        partition: &str,
        collection: Collection,
        id: &str,
        body: Value,
        expected: Option<&ConcurrencyToken>,
    ) -> Result<ConcurrencyToken, RepositoryError> {
        self.check_online()?;
        let mut documents = lock_documents(&self.shared);
        let key = doc_id(partition, collection, id);
        let current = documents.get(&key).map(|(_, token)| token);

        let allowed = match (current, expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => current == expected,
            _ => false,
        };
        if !allowed {
            return Err(RepositoryError::ConcurrencyConflict {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        let token = new_token();
        documents.insert(key, (body, token.clone()));
        Ok(token)
    }

    fn query(
        &self,
        partition: &str,
        collection: Collection,
        query: Query,
    ) -> BoxStream<'static, Result<Document, RepositoryError>> {
        let shared = Arc::clone(&self.shared);
        let partition = partition.to_string();

        stream::once(async move {
            check_online(&shared)?;
            let documents = lock_documents(&shared);
            let mut matched: Vec<Document> = documents
                .iter()
                .filter(|((p, c, _), (body, _))| {
                    *p == partition && *c == collection && query.matches(body)
                })
                .map(|((_, _, id), (body, token))| Document {
                    id: id.clone(),
                    body: body.clone(),
                    token: token.clone(),
                })
                .collect();
            drop(documents);

            matched.sort_by(|a, b| query.compare(&a.body, &b.body).then_with(|| a.id.cmp(&b.id)));
            if let Some(limit) = query.limit {
                matched.truncate(limit);
            }
            Ok::<_, RepositoryError>(stream::iter(matched.into_iter().map(Ok)))
        })
        .try_flatten()
        .boxed()
    }

    async fn delete(
        &self,
        partition: &str,
        collection: Collection,
        id: &str,
        expected: &ConcurrencyToken,
    ) -> Result<(), RepositoryError> {
        self.check_online()?;
        let mut documents = lock_documents(&self.shared);
        let key = doc_id(partition, collection, id);
        match documents.get(&key) {
            None => Err(RepositoryError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
            Some((_, token)) if token != expected => Err(RepositoryError::ConcurrencyConflict {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
            Some(_) => {
                documents.remove(&key);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::FieldKind;
    use serde_json::json;

    const P: &str = "QUARTZ_TEST";

    #[tokio::test]
    async fn test_insert_requires_absence() {
        let store = InMemoryDocumentStore::new();
        let token = store
            .upsert(P, Collection::Jobs, "a", json!({"v": 1}), None)
            .await
            .unwrap();
        let err = store
            .upsert(P, Collection::Jobs, "a", json!({"v": 2}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::ConcurrencyConflict { .. }));

        let doc = store.get(P, Collection::Jobs, "a").await.unwrap();
        assert_eq!(doc.body, json!({"v": 1}));
        assert_eq!(doc.token, token);
    }

    #[tokio::test]
    async fn test_stale_token_never_overwrites() {
        let store = InMemoryDocumentStore::new();
        let first = store
            .upsert(P, Collection::Locks, "l", json!({"owner": "a"}), None)
            .await
            .unwrap();
        let second = store
            .upsert(P, Collection::Locks, "l", json!({"owner": "b"}), Some(&first))
            .await
            .unwrap();
        assert_ne!(first, second);

        let err = store
            .upsert(P, Collection::Locks, "l", json!({"owner": "c"}), Some(&first))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::ConcurrencyConflict { .. }));
        let doc = store.get(P, Collection::Locks, "l").await.unwrap();
        assert_eq!(doc.body["owner"], "b");
    }

    #[tokio::test]
    async fn test_upsert_with_token_on_missing_document_conflicts() {
        let store = InMemoryDocumentStore::new();
        let err = store
            .upsert(
                P,
                Collection::Jobs,
                "ghost",
                json!({}),
                Some(&ConcurrencyToken::new("x")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn test_delete_outcomes() {
        let store = InMemoryDocumentStore::new();
        let token = store
            .upsert(P, Collection::Jobs, "a", json!({}), None)
            .await
            .unwrap();
        let stale = ConcurrencyToken::new("stale");
        assert!(matches!(
            store.delete(P, Collection::Jobs, "a", &stale).await,
            Err(RepositoryError::ConcurrencyConflict { .. })
        ));
        store.delete(P, Collection::Jobs, "a", &token).await.unwrap();
        assert!(matches!(
            store.delete(P, Collection::Jobs, "a", &token).await,
            Err(RepositoryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let store = InMemoryDocumentStore::new();
        store
            .upsert("A", Collection::Jobs, "x", json!({}), None)
            .await
            .unwrap();
        store
            .upsert("B", Collection::Jobs, "x", json!({}), None)
            .await
            .unwrap();
        assert_eq!(store.count("A", Collection::Jobs), 1);
        assert_eq!(store.count("B", Collection::Jobs), 1);
    }

    #[tokio::test]
    async fn test_query_filters_orders_and_limits() {
        let store = InMemoryDocumentStore::new();
        for (id, prio, nft) in [("a", 1, 30), ("b", 5, 20), ("c", 5, 10), ("d", 9, 99)] {
            store
                .upsert(
                    P,
                    Collection::Triggers,
                    id,
                    json!({"priority": prio, "next_fire_time": nft, "state": "waiting"}),
                    None,
                )
                .await
                .unwrap();
        }

        let query = Query::new()
            .eq("state", "waiting")
            .lte("next_fire_time", 50i64)
            .order_desc("priority", FieldKind::Integer)
            .order_asc("next_fire_time", FieldKind::Integer)
            .limit(2);
        let ids: Vec<String> = store
            .query(P, Collection::Triggers, query.clone())
            .map_ok(|d| d.id)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec!["c", "b"]);

        // restartable: a second call re-runs the scan
        let again: Vec<Document> = store
            .query(P, Collection::Triggers, query)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_store_is_unavailable() {
        let store = InMemoryDocumentStore::new();
        store.set_online(false);
        assert!(matches!(
            store.get(P, Collection::Jobs, "a").await,
            Err(RepositoryError::StoreUnavailable(_))
        ));
        let result: Result<Vec<Document>, _> = store
            .query(P, Collection::Jobs, Query::new())
            .try_collect()
            .await;
        assert!(matches!(result, Err(RepositoryError::StoreUnavailable(_))));
        store.set_online(true);
        assert!(matches!(
            store.get(P, Collection::Jobs, "a").await,
            Err(RepositoryError::NotFound { .. })
        ));
    }
}
