// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Protocol timer management.
//!
//! All protocol timers live in one priority queue. Scheduling returns a
//! [`TimerToken`]; cancelling forgets the token and leaves the heap entry
//! behind to be skipped when it surfaces. Expired timers are handed out in
//! (fire time, scheduling order) order.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::protocols::{TimerRequest, TimerToken, TimerType};

/// A scheduled timer with its fire time and tie-break sequence
#[derive(Debug, Clone, Copy)]
struct ScheduledTimer {
    fire_at: Instant,
    seq: u64,
    token: TimerToken,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for ScheduledTimer {}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Single-shot cancellable timers on caller-supplied time
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<ScheduledTimer>>,
    live: HashMap<TimerToken, (Instant, TimerType)>,
    next_token: u64,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `timer_type` to fire `delay` after `now`
    pub fn schedule(&mut self, timer_type: TimerType, delay: Duration, now: Instant) -> TimerToken {
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        let fire_at = now + delay;

        self.heap.push(Reverse(ScheduledTimer {
            fire_at,
            seq: self.next_seq,
            token,
        }));
        self.next_seq += 1;
        self.live.insert(token, (fire_at, timer_type));
        token
    }

    /// Cancel a pending timer; returns false if it already fired or was cancelled
    pub fn cancel(&mut self, token: TimerToken) -> bool {
        self.live.remove(&token).is_some()
    }

    pub fn is_pending(&self, token: TimerToken) -> bool {
        self.live.contains_key(&token)
    }

    /// Time left before `token` fires (zero if overdue), None if not pending
    pub fn remaining(&self, token: TimerToken, now: Instant) -> Option<Duration> {
        self.live
            .get(&token)
            .map(|(fire_at, _)| fire_at.saturating_duration_since(now))
    }

    /// Earliest pending deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse(t)| t.fire_at)
    }

    /// Remove and return every timer due at or before `now`
    ///
    /// Only timers already due when the call starts are returned; a timer
    /// scheduled while the caller processes this batch waits for the next call.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerRequest> {
        let mut expired = Vec::new();
        while let Some(Reverse(next)) = self.heap.peek().copied() {
            if next.fire_at > now {
                break;
            }
            self.heap.pop();
            if let Some((fire_at, timer_type)) = self.live.remove(&next.token) {
                expired.push(TimerRequest {
                    token: next.token,
                    timer_type,
                    fire_at,
                });
            }
        }
        expired
    }

    /// Number of pending (not cancelled) timers
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Pending timers matching `pred`, in no particular order
    pub fn pending_matching(&self, pred: impl Fn(&TimerType) -> bool) -> Vec<(TimerToken, TimerType)> {
        self.live
            .iter()
            .filter(|(_, (_, t))| pred(t))
            .map(|(token, (_, t))| (*token, *t))
            .collect()
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse(next)) = self.heap.peek() {
            if self.live.contains_key(&next.token) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::pim::{ChannelId, UpstreamId};

    #[test]
    fn test_schedule_and_expire_in_order() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let late = q.schedule(TimerType::IfJoinExpiry(ChannelId(1)), Duration::from_secs(10), now);
        let early = q.schedule(TimerType::PrunePending(ChannelId(2)), Duration::from_secs(3), now);

        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(3)));
        assert!(q.pop_expired(now + Duration::from_secs(2)).is_empty());

        let fired = q.pop_expired(now + Duration::from_secs(10));
        let tokens: Vec<TimerToken> = fired.iter().map(|t| t.token).collect();
        assert_eq!(tokens, vec![early, late]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_ties_fire_in_scheduling_order() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let a = q.schedule(TimerType::Assert(ChannelId(5)), Duration::ZERO, now);
        let b = q.schedule(TimerType::Assert(ChannelId(3)), Duration::ZERO, now);
        let c = q.schedule(TimerType::UpstreamKeepalive(UpstreamId(1)), Duration::ZERO, now);

        let fired: Vec<TimerToken> = q.pop_expired(now).iter().map(|t| t.token).collect();
        assert_eq!(fired, vec![a, b, c]);
    }

    #[test]
    fn test_cancel_skips_entry() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let first = q.schedule(TimerType::IfJoinExpiry(ChannelId(1)), Duration::from_secs(1), now);
        let second = q.schedule(TimerType::IfJoinExpiry(ChannelId(2)), Duration::from_secs(2), now);

        assert!(q.cancel(first));
        assert!(!q.cancel(first));
        assert!(!q.is_pending(first));
        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(2)));

        let fired = q.pop_expired(now + Duration::from_secs(5));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].token, second);
    }

    #[test]
    fn test_remaining() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let t = q.schedule(TimerType::IfJoinExpiry(ChannelId(1)), Duration::from_secs(100), now);

        assert_eq!(
            q.remaining(t, now + Duration::from_secs(30)),
            Some(Duration::from_secs(70))
        );
        assert_eq!(q.remaining(t, now + Duration::from_secs(200)), Some(Duration::ZERO));
        q.cancel(t);
        assert_eq!(q.remaining(t, now), None);
    }

    #[test]
    fn test_tokens_never_reused() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let a = q.schedule(TimerType::Assert(ChannelId(1)), Duration::ZERO, now);
        q.pop_expired(now);
        let b = q.schedule(TimerType::Assert(ChannelId(1)), Duration::ZERO, now);
        assert_ne!(a, b);
    }

    #[test]
    fn test_timer_scheduled_during_batch_waits() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        q.schedule(TimerType::Assert(ChannelId(1)), Duration::ZERO, now);
        let batch = q.pop_expired(now);
        assert_eq!(batch.len(), 1);

        // A zero-delay timer scheduled while handling the batch
        let next = q.schedule(TimerType::Assert(ChannelId(2)), Duration::ZERO, now);
        assert!(q.is_pending(next));
        assert_eq!(q.pop_expired(now).len(), 1);
    }
}
