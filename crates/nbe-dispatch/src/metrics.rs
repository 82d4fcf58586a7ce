//! Metric names recorded through the `metrics` facade.

/// Tasks accepted by a session (counter).
pub const TASKS_TOTAL: &str = "dispatch_tasks_total";
/// Groups sent to agents (counter, label `kind`).
pub const GROUPS_FLUSHED_TOTAL: &str = "dispatch_groups_flushed_total";
/// Group sends that failed (counter).
pub const SEND_FAILURES_TOTAL: &str = "dispatch_send_failures_total";
/// Reply entries dropped as unknown or mismatched (counter, label `reason`).
pub const REPLIES_DISCARDED_TOTAL: &str = "dispatch_replies_discarded_total";
/// Registered sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "dispatch_sessions_active";
/// Sessions evicted by the liveness sweep (counter).
pub const SESSIONS_EVICTED_TOTAL: &str = "dispatch_sessions_evicted_total";
/// Proxy regenerations run (counter, label `outcome`).
pub const REGENERATIONS_TOTAL: &str = "dispatch_regenerations_total";
