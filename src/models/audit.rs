use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ContentType;

/// Record of one filtering decision, published for the host application's log view
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub request_id: u64,
    pub client: String,
    pub url: String,
    pub content_type: ContentType,
    pub third_party: bool,
    pub blocked: bool,
    pub timestamp: DateTime<Utc>,
}

/// Blocked/allowed request counters owned by the embedding application
#[derive(Debug, Default)]
pub struct RequestStats {
    blocked: AtomicU64,
    allowed: AtomicU64,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, blocked: bool) {
        if blocked {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }

    pub fn allowed(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }
}
