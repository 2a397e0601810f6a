use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Group assigned to jobs and triggers stored without an explicit group
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Group holding the one-shot triggers created when a failed node's work is recovered
pub const RECOVERING_JOBS_GROUP: &str = "RECOVERING_JOBS";

/// Marker group name recorded while every trigger group is paused
pub const ALL_GROUPS_PAUSED: &str = "_$_ALL_GROUPS_PAUSED_$_";

// ============================================================================
// Keys
// ============================================================================

/// Identity of a job within one scheduler partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn in_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Identity of a trigger within one scheduler partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn in_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

// ============================================================================
// Job data
// ============================================================================

/// A single value held in a job or trigger data map
#[derive(Debug, Clone, PartialEq)]
pub enum JobDataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl JobDataValue {
    /// Type tag used in stored documents
    pub fn type_name(&self) -> &'static str {
        match self {
            JobDataValue::String(_) => "string",
            JobDataValue::Integer(_) => "integer",
            JobDataValue::Float(_) => "float",
            JobDataValue::Boolean(_) => "boolean",
            JobDataValue::DateTime(_) => "datetime",
            JobDataValue::Bytes(_) => "bytes",
        }
    }
}

impl From<&str> for JobDataValue {
    fn from(value: &str) -> Self {
        JobDataValue::String(value.to_string())
    }
}

impl From<String> for JobDataValue {
    fn from(value: String) -> Self {
        JobDataValue::String(value)
    }
}

impl From<i64> for JobDataValue {
    fn from(value: i64) -> Self {
        JobDataValue::Integer(value)
    }
}

impl From<f64> for JobDataValue {
    fn from(value: f64) -> Self {
        JobDataValue::Float(value)
    }
}

impl From<bool> for JobDataValue {
    fn from(value: bool) -> Self {
        JobDataValue::Boolean(value)
    }
}

impl From<DateTime<Utc>> for JobDataValue {
    fn from(value: DateTime<Utc>) -> Self {
        JobDataValue::DateTime(value)
    }
}

impl From<Vec<u8>> for JobDataValue {
    fn from(value: Vec<u8>) -> Self {
        JobDataValue::Bytes(value)
    }
}

/// Ordered string-keyed data map attached to jobs and triggers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDataMap(BTreeMap<String, JobDataValue>);

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JobDataValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&JobDataValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<JobDataValue> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobDataValue)> {
        self.0.iter()
    }

    /// Copy every entry of `other` into this map, overwriting existing keys
    pub fn merge(&mut self, other: &JobDataMap) {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

impl FromIterator<(String, JobDataValue)> for JobDataMap {
    fn from_iter<I: IntoIterator<Item = (String, JobDataValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Stored job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    /// Reference to the job implementation the engine instantiates
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Durable jobs survive having no triggers left
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub concurrent_execution_disallowed: bool,
    #[serde(default)]
    pub persist_job_data_after_execution: bool,
    #[serde(skip)]
    pub job_data: JobDataMap,
}

impl JobDetail {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            description: None,
            durable: false,
            concurrent_execution_disallowed: false,
            persist_job_data_after_execution: false,
            job_data: JobDataMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn disallow_concurrent_execution(mut self) -> Self {
        self.concurrent_execution_disallowed = true;
        self
    }

    pub fn persist_job_data_after_execution(mut self) -> Self {
        self.persist_job_data_after_execution = true;
        self
    }

    pub fn with_job_data(mut self, job_data: JobDataMap) -> Self {
        self.job_data = job_data;
        self
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// Lifecycle state of a stored trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Waiting,
    Acquired,
    Executing,
    Complete,
    Paused,
    Blocked,
    Error,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "waiting",
            TriggerState::Acquired => "acquired",
            TriggerState::Executing => "executing",
            TriggerState::Complete => "complete",
            TriggerState::Paused => "paused",
            TriggerState::Blocked => "blocked",
            TriggerState::Error => "error",
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific schedule payload of a trigger, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fires at `start_time + n * repeat_interval_ms` for `n` in `0..=repeat_count`
    Simple {
        repeat_interval_ms: i64,
        /// `-1` repeats forever
        repeat_count: i32,
    },
    /// Second-precision cron expression evaluated in `timezone`
    Cron { expression: String, timezone: Tz },
}

impl Schedule {
    pub fn once() -> Self {
        Schedule::Simple {
            repeat_interval_ms: 0,
            repeat_count: 0,
        }
    }

    pub fn every(interval: chrono::Duration) -> Self {
        Schedule::Simple {
            repeat_interval_ms: interval.num_milliseconds(),
            repeat_count: REPEAT_INDEFINITELY,
        }
    }

    pub fn cron(expression: impl Into<String>, timezone: Tz) -> Self {
        Schedule::Cron {
            expression: expression.into(),
            timezone,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Simple { .. } => "simple",
            Schedule::Cron { .. } => "cron",
        }
    }
}

/// Repeat count of a simple schedule that never runs out
pub const REPEAT_INDEFINITELY: i32 = -1;

/// Misfire instruction codes stored on a trigger
pub mod misfire {
    pub const SMART_POLICY: i32 = 0;
    pub const FIRE_NOW: i32 = 1;
    pub const RESCHEDULE_NEXT: i32 = 2;
    pub const SKIP_OCCURRENCE: i32 = 3;
    pub const MARK_ERROR: i32 = 4;
}

/// Interpreted misfire instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisfireInstruction {
    /// Move the next fire time to `now`
    FireNow,
    /// Move the next fire time to the first fire time after `now`
    RescheduleNext,
    /// Advance past the missed occurrence only
    SkipOccurrence,
    /// Put the trigger into the error state
    MarkError,
}

impl MisfireInstruction {
    /// Resolve a stored code; `None` means the code is not a known instruction
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            misfire::SMART_POLICY | misfire::FIRE_NOW => Some(MisfireInstruction::FireNow),
            misfire::RESCHEDULE_NEXT => Some(MisfireInstruction::RescheduleNext),
            misfire::SKIP_OCCURRENCE => Some(MisfireInstruction::SkipOccurrence),
            misfire::MARK_ERROR => Some(MisfireInstruction::MarkError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MisfireInstruction::FireNow => "fire_now",
            MisfireInstruction::RescheduleNext => "reschedule_next",
            MisfireInstruction::SkipOccurrence => "skip_occurrence",
            MisfireInstruction::MarkError => "mark_error",
        }
    }
}

/// What cluster recovery does with a trigger whose execution was interrupted by a node failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Re-fire the interrupted occurrence through a one-shot recovery trigger
    #[default]
    Reschedule,
    MarkError,
}

/// Stored trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(flatten)]
    pub key: TriggerKey,
    pub job_key: JobKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub previous_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub misfire_instruction: i32,
    #[serde(default)]
    pub recovery_policy: RecoveryPolicy,
    pub state: TriggerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_name: Option<String>,
    pub schedule: Schedule,
    #[serde(default)]
    pub times_triggered: u32,
    /// Fire instance of the most recent acquisition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fire_instance_id: Option<String>,
    #[serde(skip)]
    pub job_data: JobDataMap,
}

/// Priority assigned to triggers that do not set one
pub const DEFAULT_PRIORITY: i32 = 5;

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl Trigger {
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule) -> Self {
        Self {
            key,
            job_key,
            description: None,
            priority: DEFAULT_PRIORITY,
            start_time: Utc::now(),
            end_time: None,
            next_fire_time: None,
            previous_fire_time: None,
            misfire_instruction: misfire::SMART_POLICY,
            recovery_policy: RecoveryPolicy::default(),
            state: TriggerState::Waiting,
            calendar_name: None,
            schedule,
            times_triggered: 0,
            fire_instance_id: None,
            job_data: JobDataMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn starting_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn ending_at(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_next_fire_time(mut self, next_fire_time: DateTime<Utc>) -> Self {
        self.next_fire_time = Some(next_fire_time);
        self
    }

    pub fn with_misfire_instruction(mut self, code: i32) -> Self {
        self.misfire_instruction = code;
        self
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    pub fn with_calendar(mut self, calendar_name: impl Into<String>) -> Self {
        self.calendar_name = Some(calendar_name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_job_data(mut self, job_data: JobDataMap) -> Self {
        self.job_data = job_data;
        self
    }
}

// ============================================================================
// Cluster bookkeeping documents
// ============================================================================

/// State of a fired-trigger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiredState {
    Acquired,
    Executing,
}

impl FiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FiredState::Acquired => "acquired",
            FiredState::Executing => "executing",
        }
    }
}

/// Marker that a node has taken responsibility for one trigger occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub fire_instance_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    /// Owning node
    pub instance_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub fired_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub scheduled_at: DateTime<Utc>,
    pub priority: i32,
    pub state: FiredState,
    #[serde(default)]
    pub concurrent_execution_disallowed: bool,
}

/// Named distributed lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDocument {
    pub lock_name: String,
    pub owner: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub acquired_at: DateTime<Utc>,
}

/// Liveness record of one cluster node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval_ms: i64,
}

impl SchedulerStateRecord {
    /// A node is presumed dead once it has missed check-ins for twice its own interval
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        let limit = chrono::Duration::milliseconds(self.checkin_interval_ms.saturating_mul(2));
        now - self.last_checkin > limit
    }
}

/// Presence pauses every trigger in `group`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedTriggerGroup {
    pub group: String,
}

/// Presence pauses every trigger whose job belongs to `group`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedJobGroup {
    pub group: String,
}

// ============================================================================
// Firing protocol
// ============================================================================

/// Everything the engine needs to run one fired occurrence
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerFiredBundle {
    pub job: JobDetail,
    /// Trigger as stored after the firing was recorded
    pub trigger: Trigger,
    pub calendar: Option<crate::calendar::Calendar>,
    pub fire_instance_id: String,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    /// True when the occurrence replays work interrupted by a failed node
    pub recovering: bool,
}

impl TriggerFiredBundle {
    /// Completion instruction for a job that ran normally
    pub fn default_completion(&self) -> CompletedExecutionInstruction {
        if self.next_fire_time.is_none() {
            CompletedExecutionInstruction::DeleteTrigger
        } else {
            CompletedExecutionInstruction::Noop
        }
    }
}

/// Result of reporting a trigger as fired
#[derive(Debug, Clone, PartialEq)]
pub enum CommitInstruction {
    /// Run the job described by the bundle
    Execute(Box<TriggerFiredBundle>),
    /// The trigger is no longer ours to fire; the engine should drop it
    Skip { reason: String },
}

/// Instruction the engine returns after a job execution completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    Noop,
    ReExecuteJob,
    SetTriggerComplete,
    DeleteTrigger,
    SetAllJobTriggersComplete,
    SetTriggerError,
    SetAllJobTriggersError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_display() {
        assert_eq!(TriggerKey::new("t1", "reports").to_string(), "reports.t1");
        assert_eq!(JobKey::in_default_group("j").to_string(), "DEFAULT.j");
    }

    #[test]
    fn test_misfire_codes() {
        assert_eq!(
            MisfireInstruction::from_code(misfire::SMART_POLICY),
            Some(MisfireInstruction::FireNow)
        );
        assert_eq!(
            MisfireInstruction::from_code(misfire::MARK_ERROR),
            Some(MisfireInstruction::MarkError)
        );
        assert_eq!(MisfireInstruction::from_code(42), None);
        assert_eq!(MisfireInstruction::from_code(-1), None);
    }

    #[test]
    fn test_trigger_document_shape() {
        let t0 = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let trigger = Trigger::new(
            TriggerKey::new("t1", "g1"),
            JobKey::new("j1", "g1"),
            Schedule::once(),
        )
        .starting_at(t0)
        .with_next_fire_time(t0);

        let doc = serde_json::to_value(&trigger).unwrap();
        assert_eq!(doc["name"], "t1");
        assert_eq!(doc["group"], "g1");
        assert_eq!(doc["job_key"]["name"], "j1");
        assert_eq!(doc["next_fire_time"], 1_700_000_000_000i64);
        assert_eq!(doc["state"], "waiting");
        assert_eq!(doc["schedule"]["kind"], "simple");

        let back: Trigger = serde_json::from_value(doc).unwrap();
        assert_eq!(back, trigger);
    }

    #[test]
    fn test_unknown_schedule_kind_is_rejected() {
        let doc = serde_json::json!({
            "name": "t", "group": "g",
            "job_key": {"name": "j", "group": "g"},
            "start_time": 0, "state": "waiting",
            "schedule": {"kind": "lunar"}
        });
        assert!(serde_json::from_value::<Trigger>(doc).is_err());
    }

    #[test]
    fn test_state_record_staleness() {
        let t0 = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let record = SchedulerStateRecord {
            instance_id: "n1".into(),
            last_checkin: t0,
            checkin_interval_ms: 1_000,
        };
        assert!(!record.is_stale_at(t0 + chrono::Duration::milliseconds(2_000)));
        assert!(record.is_stale_at(t0 + chrono::Duration::milliseconds(2_001)));
    }

    #[test]
    fn test_job_data_map_merge() {
        let mut a = JobDataMap::new();
        a.insert("x", 1i64);
        let mut b = JobDataMap::new();
        b.insert("x", 2i64);
        b.insert("y", true);
        a.merge(&b);
        assert_eq!(a.get("x"), Some(&JobDataValue::Integer(2)));
        assert_eq!(a.len(), 2);
    }
}
