use std::sync::Arc;
use std::time::Instant;

use crate::indexer::GovernanceIndex;

#[derive(Clone)]
pub struct AppState {
    pub index: Arc<GovernanceIndex>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(index: Arc<GovernanceIndex>) -> Self {
        Self {
            index,
            start_time: Instant::now(),
        }
    }
}
