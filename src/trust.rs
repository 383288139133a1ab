//! C9: trust enforcement hook (§4.7). Optional middleware consulted before
//! sensitive operations; absent any configured policy the default is
//! allow-all, logged once at startup so the permissive posture is never
//! silent.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TrustRequest {
    pub(crate) operation: String,
    pub(crate) user_id: String,
    pub(crate) ip: String,
    pub(crate) device_fingerprint: String,
    pub(crate) action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TrustDecision {
    pub(crate) allowed: bool,
    pub(crate) denial_reason: Option<String>,
}

pub(crate) trait TrustHook: Send + Sync {
    fn evaluate(&self, request: &TrustRequest) -> TrustDecision;
}

pub(crate) struct AllowAllTrustHook;

impl AllowAllTrustHook {
    pub(crate) fn new_logged() -> Self {
        tracing::warn!("trust enforcement hook not configured; defaulting to allow-all policy");
        AllowAllTrustHook
    }
}

impl TrustHook for AllowAllTrustHook {
    fn evaluate(&self, _request: &TrustRequest) -> TrustDecision {
        TrustDecision {
            allowed: true,
            denial_reason: None,
        }
    }
}
