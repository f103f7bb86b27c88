//! # System Constants
//!
//! Topic names, key namespaces and defaults shared across the orchestration core.

/// Signal topics exchanged between a scan orchestrator and its workers.
pub mod topics {
    /// Sent by every batch worker when its batch is finished.
    pub const BATCH_COMPLETE: &str = "batch_complete";
    /// Sent once by the dispatcher after the last batch worker was enqueued.
    pub const ALL_TRANSMITTED: &str = "all_transmitted";
    /// Workflow launch requests.
    pub const WORKFLOW_REQUEST: &str = "workflow_request";
}

/// Mailbox destinations that are not a specific workflow.
pub mod destinations {
    /// Queue that orchestrators claim workflow launch requests from.
    pub const WORKFLOW_QUEUE: &str = "workflow_queue";
}

/// Key namespaces inside the shared store.
pub mod keys {
    use uuid::Uuid;

    pub const JOB_PREFIX: &str = "job:";
    pub const SCAN_PREFIX: &str = "scan:";
    pub const PERMIT_PREFIX: &str = "permit:";

    pub fn job(job_id: Uuid) -> String {
        format!("{JOB_PREFIX}{job_id}")
    }

    pub fn scan_expected_total(scan_id: Uuid) -> String {
        format!("{SCAN_PREFIX}{scan_id}:expected_total")
    }

    pub fn scan_finalized(scan_id: Uuid) -> String {
        format!("{SCAN_PREFIX}{scan_id}:finalized")
    }

    /// Prefix of every per-batch tally document of a scan
    pub fn scan_batches(scan_id: Uuid) -> String {
        format!("{SCAN_PREFIX}{scan_id}:batch:")
    }

    pub fn scan_batch(scan_id: Uuid, batch_id: u64) -> String {
        format!("{}{batch_id}", scan_batches(scan_id))
    }

    pub fn scan(scan_id: Uuid) -> String {
        format!("{SCAN_PREFIX}{scan_id}:")
    }

    pub fn permit(name: &str) -> String {
        format!("{PERMIT_PREFIX}{name}")
    }
}

/// Consecutive release failures before a critical alert is emitted.
pub const DEFAULT_RELEASE_ALERT_THRESHOLD: u64 = 3;

/// Maximum CAS attempts for a single job mutation before giving up.
pub const MAX_JOB_WRITE_ATTEMPTS: u32 = 8;

#[cfg(test)]
mod tests {
    use super::keys;
    use uuid::Uuid;

    #[test]
    fn test_scan_keys_are_namespaced_by_scan_id() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(keys::scan_batch(a, 1), keys::scan_batch(b, 1));
        assert!(keys::scan_expected_total(a).starts_with(&keys::scan(a)));
        assert!(keys::scan_batch(a, 7).starts_with(&keys::scan_batches(a)));
        assert!(keys::scan_batches(a).starts_with(&keys::scan(a)));
    }
}
