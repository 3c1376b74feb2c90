//! Per-request caller identity and quota.

use serde::{Deserialize, Serialize};

/// Identity and quota limits of the caller, passed explicitly through the
/// pipeline. Nothing in the upload path reads ambient per-request state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Authenticated user id.
    pub user_id: String,
    /// Total space in bytes this account may use.
    pub quota_bytes: i64,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>, quota_bytes: i64) -> Self {
        Self {
            user_id: user_id.into(),
            quota_bytes,
        }
    }
}
