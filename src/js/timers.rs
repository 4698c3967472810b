use std::collections::BTreeMap;

use tokio::time::{Duration, Instant};

use crate::lifecycle::Generation;

/// Id handed to sandboxed code by `setTimeout`/`setInterval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u32);

impl TimerId {
    pub fn get(self) -> u32 {
        self.0
    }

    /// Accept only ids that could have come from this registry: finite,
    /// integral, positive and in range.
    pub fn from_script(raw: f64) -> Option<Self> {
        if raw.is_finite() && raw.fract() == 0.0 && raw >= 1.0 && raw <= f64::from(u32::MAX) {
            Some(Self(raw as u32))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OneShot,
    Repeating,
}

#[derive(Debug, Clone, Copy)]
enum Schedule {
    Armed { due: Instant },
    Suspended { remaining: Duration },
}

#[derive(Debug)]
struct TimerEntry {
    generation: Generation,
    kind: TimerKind,
    period: Duration,
    schedule: Schedule,
}

/// Bookkeeping for every sandbox timer; callbacks stay inside the
/// sandbox, keyed by [`TimerId`].
///
/// Every entry carries the generation that created it. Cancels are only
/// honoured for the caller's own generation, and retiring a generation
/// drops its entries in one pass.
#[derive(Debug)]
pub struct TimerRegistry {
    next_id: u32,
    entries: BTreeMap<TimerId, TimerEntry>,
    min_interval: Duration,
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl TimerRegistry {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
            min_interval: min_interval.max(Duration::from_millis(1)),
        }
    }

    /// Register a timer. A suspended registration keeps its full delay
    /// until [`TimerRegistry::resume`].
    pub fn schedule(
        &mut self,
        generation: Generation,
        kind: TimerKind,
        delay: Duration,
        now: Instant,
        suspended: bool,
    ) -> TimerId {
        let id = self.allocate_id();
        let period = match kind {
            TimerKind::OneShot => delay,
            TimerKind::Repeating => delay.max(self.min_interval),
        };
        let schedule = if suspended {
            Schedule::Suspended { remaining: period }
        } else {
            Schedule::Armed { due: now + period }
        };
        self.entries.insert(
            id,
            TimerEntry {
                generation,
                kind,
                period,
                schedule,
            },
        );
        tracing::trace!(target: "worker", %generation, timer = id.0, ?kind, ?period, suspended, "timer scheduled");
        id
    }

    /// Cancel `id` on behalf of `generation`. Unknown ids and ids owned by
    /// another generation are ignored.
    pub fn cancel(&mut self, generation: Generation, id: TimerId) -> bool {
        match self.entries.get(&id) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(&id);
                true
            }
            _ => {
                tracing::trace!(target: "worker", %generation, timer = id.0, "ignored cancel of foreign timer id");
                false
            }
        }
    }

    /// Freeze the remaining time of every armed timer of `generation`.
    pub fn suspend(&mut self, generation: Generation, now: Instant) -> usize {
        let mut count = 0;
        for entry in self.entries.values_mut() {
            if entry.generation != generation {
                continue;
            }
            if let Schedule::Armed { due } = entry.schedule {
                entry.schedule = Schedule::Suspended {
                    remaining: due.saturating_duration_since(now),
                };
                count += 1;
            }
        }
        count
    }

    /// Re-arm suspended timers so they pick up where they left off.
    pub fn resume(&mut self, generation: Generation, now: Instant) -> usize {
        let mut count = 0;
        for entry in self.entries.values_mut() {
            if entry.generation != generation {
                continue;
            }
            if let Schedule::Suspended { remaining } = entry.schedule {
                entry.schedule = Schedule::Armed {
                    due: now + remaining,
                };
                count += 1;
            }
        }
        count
    }

    /// Armed timers of `generation` that are due, earliest first.
    pub fn due(&self, generation: Generation, now: Instant) -> Vec<TimerId> {
        let mut due: Vec<(Instant, TimerId)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.generation == generation)
            .filter_map(|(id, entry)| match entry.schedule {
                Schedule::Armed { due } if due <= now => Some((due, *id)),
                _ => None,
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Re-check `id` right before its callback runs and advance its
    /// schedule. Returns `None` when the timer must not fire anymore.
    ///
    /// A repeating timer that fell behind skips its missed ticks instead of
    /// firing them in a burst.
    pub fn begin_fire(
        &mut self,
        generation: Generation,
        id: TimerId,
        now: Instant,
    ) -> Option<TimerKind> {
        let entry = self.entries.get_mut(&id)?;
        if entry.generation != generation {
            return None;
        }
        let Schedule::Armed { due } = entry.schedule else {
            return None;
        };
        if due > now {
            return None;
        }

        let kind = entry.kind;
        match kind {
            TimerKind::OneShot => {
                self.entries.remove(&id);
            }
            TimerKind::Repeating => {
                let mut next = due + entry.period;
                if next <= now {
                    next = now + entry.period;
                }
                entry.schedule = Schedule::Armed { due: next };
            }
        }
        Some(kind)
    }

    /// Drop every entry whose generation is `generation` or older.
    pub fn retire(&mut self, generation: Generation) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.generation > generation);
        let removed = before - self.entries.len();
        tracing::debug!(target: "worker", %generation, removed, "retired generation timers");
        removed
    }

    pub fn next_deadline(&self, generation: Generation) -> Option<Instant> {
        self.entries
            .values()
            .filter(|entry| entry.generation == generation)
            .filter_map(|entry| match entry.schedule {
                Schedule::Armed { due } => Some(due),
                Schedule::Suspended { .. } => None,
            })
            .min()
    }

    pub fn live_count(&self, generation: Generation) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.generation == generation)
            .count()
    }

    fn allocate_id(&mut self) -> TimerId {
        loop {
            let id = TimerId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}
