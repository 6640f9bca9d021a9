//! In-memory ring buffer of recent command attempts.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::BridgeError;

pub const DEFAULT_AUDIT_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub index: u64,
    pub started_at: DateTime<Utc>,
    pub infrastructure_id: String,
    pub caller: Option<String>,
    pub command: String,
    pub attempt: u32,
    pub status: AuditStatus,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub error_code: Option<&'static str>,
}

/// Handle to the slot opened by [`AuditLog::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditToken(u64);

impl AuditToken {
    pub fn index(self) -> u64 {
        self.0
    }
}

struct Ring {
    entries: VecDeque<AuditEntry>,
    next_index: u64,
}

pub struct AuditLog {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                next_index: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Open a `Running` entry, evicting the oldest one when full.
    pub fn begin(
        &self,
        infrastructure_id: &str,
        caller: Option<&str>,
        command: impl Into<String>,
        attempt: u32,
    ) -> AuditToken {
        let mut ring = self.ring.lock();
        let index = ring.next_index;
        ring.next_index += 1;
        if ring.entries.len() == self.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(AuditEntry {
            index,
            started_at: Utc::now(),
            infrastructure_id: infrastructure_id.to_string(),
            caller: caller.map(str::to_string),
            command: command.into(),
            attempt,
            status: AuditStatus::Running,
            duration_ms: None,
            error: None,
            error_code: None,
        });
        AuditToken(index)
    }

    /// Finalize an entry. Entries that were evicted or already finalized are left alone.
    pub fn complete(
        &self,
        token: AuditToken,
        status: AuditStatus,
        duration: Duration,
        error: Option<&BridgeError>,
    ) -> bool {
        let mut ring = self.ring.lock();
        let Some(front) = ring.entries.front().map(|entry| entry.index) else {
            return false;
        };
        let Some(offset) = token.0.checked_sub(front) else {
            return false;
        };
        let Some(entry) = usize::try_from(offset)
            .ok()
            .and_then(|offset| ring.entries.get_mut(offset))
        else {
            return false;
        };
        if entry.index != token.0 || entry.status != AuditStatus::Running {
            return false;
        }
        entry.status = status;
        entry.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        if let Some(err) = error {
            entry.error = Some(err.to_string());
            entry.error_code = Some(err.code());
        }
        true
    }

    /// Most recent first.
    pub fn list(&self) -> Vec<AuditEntry> {
        self.ring.lock().entries.iter().rev().cloned().collect()
    }

    pub fn clear(&self) {
        self.ring.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
