use std::collections::HashMap;

use tokio::time::Instant;

/// Every deadline the session can have outstanding. Scheduling a kind that
/// is already pending replaces its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Reconnect,
    StreamFlush,
    RemoteTyping,
    BanLapse,
    NotificationExpiry(String),
}

#[derive(Debug, Default)]
pub struct TimerSet {
    deadlines: HashMap<TimerKind, Instant>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines.insert(kind, at);
    }

    pub fn cancel(&mut self, kind: &TimerKind) -> bool {
        self.deadlines.remove(kind).is_some()
    }

    pub fn is_pending(&self, kind: &TimerKind) -> bool {
        self.deadlines.contains_key(kind)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Removes and returns every timer due at `now`, earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(kind, at)| (*at, kind.clone()))
            .collect();
        due.sort_by_key(|(at, _)| *at);
        for (_, kind) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
