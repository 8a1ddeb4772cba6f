use serde::{Deserialize, Serialize};

/// Summary of one sweep across every partition and nodegroup. Errors
/// recorded here never abort the sweep — spec.md §7's propagation policy
/// is "log and continue to the next nodegroup".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub nodegroups_swept: u32,
    pub nodegroups_skipped_lock_timeout: u32,
    pub acquisitions: u32,
    pub acquisitions_exhausted: u32,
    pub transplants_completed: u32,
    pub transplants_aborted: u32,
    pub orphan_instances_terminated: u32,
    pub orphan_spots_cancelled: u32,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn new() -> Self {
        Self::default()
    }
}
