use std::collections::HashMap;

use crate::lib::process::types::ProcessTracker;
use crate::lib::store::types::RecordStore;
use crate::lib::worker::types::Worker;

/// Entry point for lifecycle commands on this node. Holds one worker per
/// engine name; every worker shares the node's process tracker.
pub struct Scheduler {
    pub(super) workers: HashMap<String, Worker>,
    pub(super) records: RecordStore,
    pub(super) tracker: ProcessTracker,
}
