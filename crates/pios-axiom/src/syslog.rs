//! System Event Log (SysLog)
//!
//! Who asked the kernel for what, and what they got back. Each syscall is
//! a `Request` event followed by a `Response` event naming it; the commits
//! in between live in the CommitLog.

use alloc::collections::VecDeque;
use serde::{Deserialize, Serialize};

use crate::types::{EnvRef, EventId};

/// Events retained by default
pub const DEFAULT_EVENTS: usize = 10_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SysEvent {
    /// Monotonic, never reused
    pub id: EventId,
    pub sender: EnvRef,
    /// Nanoseconds since boot
    pub at: u64,
    pub event_type: SysEventType,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SysEventType {
    /// Trap-frame view of the call
    Request { syscall_num: u32, args: [u64; 5] },
    /// Value written back to the result register
    Response { request_id: EventId, result: i64 },
}

/// Bounded syscall audit log; the oldest events fall off the front.
pub struct SysLog {
    events: VecDeque<SysEvent>,
    capacity: usize,
    next_id: EventId,
}

impl SysLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(2),
            next_id: 0,
        }
    }

    fn record(&mut self, sender: EnvRef, at: u64, event_type: SysEventType) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(SysEvent {
            id,
            sender,
            at,
            event_type,
        });
        id
    }

    /// Returns the id the matching response must name.
    pub fn log_request(&mut self, sender: EnvRef, syscall_num: u32, args: [u64; 5], at: u64) -> EventId {
        self.record(sender, at, SysEventType::Request { syscall_num, args })
    }

    pub fn log_response(&mut self, sender: EnvRef, request_id: EventId, result: i64, at: u64) -> EventId {
        self.record(sender, at, SysEventType::Response { request_id, result })
    }

    /// Retained events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SysEvent> {
        self.events.iter()
    }

    pub fn get(&self, id: EventId) -> Option<&SysEvent> {
        let first = self.events.front()?.id;
        let offset = usize::try_from(id.checked_sub(first)?).ok()?;
        self.events.get(offset)
    }

    /// Result returned for a request, if its response is retained.
    pub fn result_of(&self, request: EventId) -> Option<i64> {
        self.events.iter().find_map(|e| match e.event_type {
            SysEventType::Response { request_id, result } if request_id == request => Some(result),
            _ => None,
        })
    }

    /// Requests issued by one environment, oldest first.
    pub fn requests_from(&self, sender: EnvRef) -> impl Iterator<Item = &SysEvent> {
        self.events.iter().filter(move |e| {
            e.sender == sender && matches!(e.event_type, SysEventType::Request { .. })
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_id(&self) -> EventId {
        self.next_id
    }
}

impl Default for SysLog {
    fn default() -> Self {
        Self::new()
    }
}
