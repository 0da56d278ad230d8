use crate::orchestration::session_store::SessionStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub session_id: String,
    pub protocol_id: String,
    pub status: SessionStatus,
    pub fsm_state: String,
    pub revision: u64,
    #[serde(default)]
    pub sealed_steps: usize,
    #[serde(default)]
    pub in_flight_phase: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub summary: String,
    pub pending_external_input: bool,
    pub next_expected_action: String,
}
