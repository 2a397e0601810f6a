// Typed entity access on top of the document repository

use super::{Collection, ConcurrencyToken, Document, DocumentRepository, Query};
use crate::calendar::Calendar;
use crate::errors::{JobStoreError, RepositoryError};
use crate::models::{
    FiredTriggerRecord, JobDataMap, JobDetail, JobKey, LockDocument, PausedJobGroup,
    PausedTriggerGroup, SchedulerStateRecord, Trigger, TriggerKey,
};
use crate::serialization::DocumentSerializer;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Upper bound on compare-and-set rounds before a conflict is surfaced
const MAX_UPDATE_ATTEMPTS: usize = 32;

/// Document id of a `(name, group)` key; the length prefix keeps ids unique
/// even when names or groups contain the separator
pub fn key_id(group: &str, name: &str) -> String {
    format!("{}:{}:{}", group.len(), group, name)
}

pub fn job_id(key: &JobKey) -> String {
    key_id(&key.group, &key.name)
}

pub fn trigger_id(key: &TriggerKey) -> String {
    key_id(&key.group, &key.name)
}

/// Something stored as one document in a fixed collection
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn document_id(&self) -> String;

    fn data_map(&self) -> Option<&JobDataMap> {
        None
    }

    fn set_data_map(&mut self, _data: JobDataMap) {}
}

impl Entity for JobDetail {
    const COLLECTION: Collection = Collection::Jobs;

    fn document_id(&self) -> String {
        job_id(&self.key)
    }

    fn data_map(&self) -> Option<&JobDataMap> {
        Some(&self.job_data)
    }

    fn set_data_map(&mut self, data: JobDataMap) {
        self.job_data = data;
    }
}

impl Entity for Trigger {
    const COLLECTION: Collection = Collection::Triggers;

    fn document_id(&self) -> String {
        trigger_id(&self.key)
    }

    fn data_map(&self) -> Option<&JobDataMap> {
        Some(&self.job_data)
    }

    fn set_data_map(&mut self, data: JobDataMap) {
        self.job_data = data;
    }
}

impl Entity for Calendar {
    const COLLECTION: Collection = Collection::Calendars;

    fn document_id(&self) -> String {
        self.name.clone()
    }
}

impl Entity for FiredTriggerRecord {
    const COLLECTION: Collection = Collection::FiredTriggers;

    fn document_id(&self) -> String {
        self.fire_instance_id.clone()
    }
}

impl Entity for LockDocument {
    const COLLECTION: Collection = Collection::Locks;

    fn document_id(&self) -> String {
        self.lock_name.clone()
    }
}

impl Entity for SchedulerStateRecord {
    const COLLECTION: Collection = Collection::SchedulerStates;

    fn document_id(&self) -> String {
        self.instance_id.clone()
    }
}

impl Entity for PausedTriggerGroup {
    const COLLECTION: Collection = Collection::PausedTriggerGroups;

    fn document_id(&self) -> String {
        self.group.clone()
    }
}

impl Entity for PausedJobGroup {
    const COLLECTION: Collection = Collection::PausedJobGroups;

    fn document_id(&self) -> String {
        self.group.clone()
    }
}

/// An entity together with the token of the version it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<E> {
    pub entity: E,
    pub token: ConcurrencyToken,
}

/// Typed CRUD for one scheduler partition
#[derive(Clone)]
pub struct EntityStore {
    repo: Arc<dyn DocumentRepository>,
    partition: String,
    serializer: DocumentSerializer,
}

impl EntityStore {
    pub fn new(
        repo: Arc<dyn DocumentRepository>,
        partition: impl Into<String>,
        serializer: DocumentSerializer,
    ) -> Self {
        Self {
            repo,
            partition: partition.into(),
            serializer,
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn serializer(&self) -> DocumentSerializer {
        self.serializer
    }

    fn decode<E: Entity>(serializer: &DocumentSerializer, doc: Document) -> Result<Versioned<E>, JobStoreError> {
        let (mut entity, data) = serializer.from_document::<E>(doc.body)?;
        entity.set_data_map(data);
        Ok(Versioned {
            entity,
            token: doc.token,
        })
    }

    fn encode<E: Entity>(&self, entity: &E) -> Result<serde_json::Value, JobStoreError> {
        self.serializer.to_document(entity, entity.data_map())
    }

    /// Read one entity; `None` when it does not exist
    pub async fn find<E: Entity>(&self, id: &str) -> Result<Option<Versioned<E>>, JobStoreError> {
        match self.repo.get(&self.partition, E::COLLECTION, id).await {
            Ok(doc) => Self::decode(&self.serializer, doc).map(Some),
            Err(RepositoryError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create an entity that must not exist yet
    pub async fn insert<E: Entity>(&self, entity: &E) -> Result<ConcurrencyToken, JobStoreError> {
        let body = self.encode(entity)?;
        let token = self
            .repo
            .upsert(&self.partition, E::COLLECTION, &entity.document_id(), body, None)
            .await?;
        Ok(token)
    }

    /// Overwrite the version identified by `token`
    pub async fn replace<E: Entity>(
        &self,
        entity: &E,
        token: &ConcurrencyToken,
    ) -> Result<ConcurrencyToken, JobStoreError> {
        let body = self.encode(entity)?;
        let token = self
            .repo
            .upsert(
                &self.partition,
                E::COLLECTION,
                &entity.document_id(),
                body,
                Some(token),
            )
            .await?;
        Ok(token)
    }

    /// Write an entity whatever version is currently stored
    pub async fn put<E: Entity>(&self, entity: &E) -> Result<ConcurrencyToken, JobStoreError> {
        let id = entity.document_id();
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = match self.repo.get(&self.partition, E::COLLECTION, &id).await {
                Ok(doc) => Some(doc.token),
                Err(RepositoryError::NotFound { .. }) => None,
                Err(e) => return Err(e.into()),
            };
            let result = match &current {
                Some(token) => self.replace(entity, token).await,
                None => self.insert(entity).await,
            };
            match result {
                Err(JobStoreError::ConcurrencyConflict(_)) => continue,
                other => return other,
            }
        }
        Err(JobStoreError::ConcurrencyConflict(format!(
            "{}/{}",
            E::COLLECTION,
            id
        )))
    }

    /// Conditionally delete the version identified by `token`
    pub async fn remove<E: Entity>(
        &self,
        id: &str,
        token: &ConcurrencyToken,
    ) -> Result<(), JobStoreError> {
        self.repo
            .delete(&self.partition, E::COLLECTION, id, token)
            .await?;
        Ok(())
    }

    /// Delete whatever version is stored; returns whether anything was removed
    pub async fn remove_if_present<E: Entity>(&self, id: &str) -> Result<bool, JobStoreError> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let token = match self.repo.get(&self.partition, E::COLLECTION, id).await {
                Ok(doc) => doc.token,
                Err(RepositoryError::NotFound { .. }) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            match self
                .repo
                .delete(&self.partition, E::COLLECTION, id, &token)
                .await
            {
                Ok(()) => return Ok(true),
                Err(RepositoryError::NotFound { .. }) => return Ok(false),
                Err(RepositoryError::ConcurrencyConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(JobStoreError::ConcurrencyConflict(format!(
            "{}/{}",
            E::COLLECTION,
            id
        )))
    }

    /// Lazily decoded query results
    pub fn stream<E: Entity>(
        &self,
        query: Query,
    ) -> BoxStream<'static, Result<Versioned<E>, JobStoreError>> {
        let serializer = self.serializer;
        self.repo
            .query(&self.partition, E::COLLECTION, query)
            .map_err(JobStoreError::from)
            .and_then(move |doc| futures::future::ready(Self::decode(&serializer, doc)))
            .boxed()
    }

    pub async fn query<E: Entity>(&self, query: Query) -> Result<Vec<Versioned<E>>, JobStoreError> {
        self.stream(query).try_collect().await
    }

    /// Compare-and-set loop: re-reads and reapplies `mutate` until the write
    /// lands on the version it was computed from.
    ///
    /// `mutate` returns `false` to leave the stored entity untouched. Returns
    /// `None` when the entity does not exist.
    pub async fn update<E, F>(
        &self,
        id: &str,
        mut mutate: F,
    ) -> Result<Option<Versioned<E>>, JobStoreError>
    where
        E: Entity + Clone,
        F: FnMut(&mut E) -> bool + Send,
    {
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let current = match self.find::<E>(id).await? {
                Some(current) => current,
                None => return Ok(None),
            };
            let mut entity = current.entity.clone();
            if !mutate(&mut entity) {
                return Ok(Some(current));
            }
            match self.replace(&entity, &current.token).await {
                Ok(token) => return Ok(Some(Versioned { entity, token })),
                Err(JobStoreError::ConcurrencyConflict(_)) => {
                    debug!(collection = %E::COLLECTION, id, attempt, "Update raced, retrying");
                }
                Err(JobStoreError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Err(JobStoreError::ConcurrencyConflict(format!(
            "{}/{}",
            E::COLLECTION,
            id
        )))
    }
}
