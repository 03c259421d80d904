//! Usage timers
//!
//! Timers are never cancelled. A usage stamps each timeout with its current
//! `timer_seq`; scheduling a new one bumps the sequence, so an older timeout
//! that fires later no longer matches and is ignored.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

use sipdum_message::Request;

use crate::usage::UsageId;

/// Lifetime of a non-INVITE transaction (64 * T1)
pub const TRANSACTION_LIFETIME: Duration = Duration::from_secs(32);

/// What a timeout asks for
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutKind {
    /// Refresh a client subscription before it expires
    SubscriptionRefresh,
    /// Re-send a failed SUBSCRIBE
    SubscriptionRetry,
    /// Server subscription reached its Expires
    SubscriptionExpired,
    RegistrationRefresh,
    PublicationRefresh,
    /// Server-side publication reached its Expires
    PublicationExpired,
    /// Stop waiting for the final NOTIFY after an unsubscribe
    SubscriptionEndGuard,
    /// Start a fresh subscription from this request template
    Resubscribe { request: Box<Request> },
    /// A request parked for an asynchronous auth decision was never decided
    AuthExpired { transaction_id: String },
}

/// A timer event delivered back to the manager
#[derive(Debug, Clone, PartialEq)]
pub struct DumTimeout {
    pub kind: TimeoutKind,
    /// Usage the timer belongs to, if any
    pub usage: Option<UsageId>,
    /// Usage `timer_seq` at scheduling time
    pub seq: u64,
}

impl DumTimeout {
    pub fn for_usage(kind: TimeoutKind, usage: UsageId, seq: u64) -> Self {
        Self {
            kind,
            usage: Some(usage),
            seq,
        }
    }

    pub fn detached(kind: TimeoutKind) -> Self {
        Self { kind, usage: None, seq: 0 }
    }
}

struct Scheduled {
    when: Instant,
    order: u64,
    timeout: DumTimeout,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.order == other.order
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first
    fn cmp(&self, other: &Self) -> Ordering {
        other.when.cmp(&self.when).then_with(|| other.order.cmp(&self.order))
    }
}

/// Deadline-ordered queue of pending timeouts
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Scheduled>,
    next_order: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, after: Duration, timeout: DumTimeout) -> Instant {
        let when = Instant::now() + after;
        self.next_order += 1;
        self.heap.push(Scheduled {
            when,
            order: self.next_order,
            timeout,
        });
        when
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|s| s.when)
    }

    /// Remove and return every timeout due at `now`, earliest first
    pub fn pop_due(&mut self, now: Instant) -> Vec<DumTimeout> {
        let mut due = Vec::new();
        while self.heap.peek().map_or(false, |s| s.when <= now) {
            if let Some(s) = self.heap.pop() {
                due.push(s.timeout);
            }
        }
        due
    }

    /// Pending timeouts with their deadlines, in no particular order
    pub fn pending(&self) -> impl Iterator<Item = (Instant, &DumTimeout)> {
        self.heap.iter().map(|s| (s.when, &s.timeout))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_due_timers_pop_in_deadline_order() {
        let mut queue = TimerQueue::new();
        queue.schedule(
            Duration::from_secs(30),
            DumTimeout::detached(TimeoutKind::PublicationRefresh),
        );
        queue.schedule(
            Duration::from_secs(10),
            DumTimeout::detached(TimeoutKind::RegistrationRefresh),
        );
        queue.schedule(
            Duration::from_secs(60),
            DumTimeout::detached(TimeoutKind::SubscriptionExpired),
        );

        assert!(queue.pop_due(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(30)).await;

        let due: Vec<_> = queue.pop_due(Instant::now()).into_iter().map(|t| t.kind).collect();
        assert_eq!(due, vec![TimeoutKind::RegistrationRefresh, TimeoutKind::PublicationRefresh]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(Instant::now() + Duration::from_secs(30)));
    }
}
