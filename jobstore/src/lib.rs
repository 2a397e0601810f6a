// Clustered job store for a cron scheduler, persisted in a document store

pub mod acquisition;
pub mod calendar;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod facade;
pub mod lock;
pub mod models;
pub mod repository;
pub mod retry;
pub mod schedule;
pub mod serialization;
pub mod telemetry;

pub use acquisition::TriggerAcquisitionEngine;
pub use calendar::{Calendar, CalendarRule};
pub use cluster::{ClusterCoordinator, CycleReport};
pub use config::Settings;
pub use errors::{JobStoreError, RepositoryError, ScheduleError, ValidationError};
pub use facade::{DocumentJobStore, JobStore};
pub use lock::{LockManager, LOCK_STATE_ACCESS, LOCK_TRIGGER_ACCESS};
pub use models::{
    CommitInstruction, CompletedExecutionInstruction, JobDataMap, JobDataValue, JobDetail, JobKey,
    MisfireInstruction, RecoveryPolicy, Schedule, Trigger, TriggerFiredBundle, TriggerKey,
    TriggerState,
};
pub use repository::{DocumentRepository, InMemoryDocumentStore, PostgresDocumentStore};
pub use serialization::{DocumentSerializer, SerializerKind};
