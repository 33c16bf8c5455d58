use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};

use uuid::Uuid;

/// Innermost slot width. Wheel time advances in multiples of this.
pub const TICK_MS: i64 = 256;
/// Slots per level.
pub const SLOTS: usize = 64;
/// Cascading levels; level 0 is the innermost.
pub const LEVELS: usize = 4;

/// One pending timer as the wheel sees it. Ordering is (fire instant,
/// log index): two timers due at the same instant fire in commit order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WheelEntry {
    pub fire_at_ms: i64,
    pub log_index: u64,
    pub timer_id: Uuid,
}

/// Hierarchical timing wheel. Four cascading levels back the bulk of pending
/// timers; entries inside the current innermost slot sit in a min-heap for
/// sub-bucket ordering, and entries beyond the outermost span wait in an
/// overflow heap until a rotation cascades them inward.
///
/// Pure data structure: single-owner, no clocks, no I/O. The tick loop feeds
/// it wall-clock milliseconds.
pub struct TimingWheel {
    /// Wheel time, always a multiple of `TICK_MS`.
    origin_ms: i64,
    levels: Vec<Vec<VecDeque<WheelEntry>>>,
    inner: BinaryHeap<Reverse<WheelEntry>>,
    overflow: BinaryHeap<Reverse<WheelEntry>>,
    tombstones: HashSet<Uuid>,
    live: usize,
    /// Entries currently held in the leveled buckets (not inner, not overflow).
    leveled: usize,
}

fn slot_width(level: usize) -> i64 {
    TICK_MS * (SLOTS as i64).pow(level as u32)
}

/// Total span the leveled wheel covers before overflow takes over.
fn wheel_span() -> i64 {
    slot_width(LEVELS - 1) * SLOTS as i64
}

impl TimingWheel {
    pub fn new(now_ms: i64) -> Self {
        Self {
            origin_ms: now_ms - now_ms.rem_euclid(TICK_MS),
            levels: (0..LEVELS)
                .map(|_| (0..SLOTS).map(|_| VecDeque::new()).collect())
                .collect(),
            inner: BinaryHeap::new(),
            overflow: BinaryHeap::new(),
            tombstones: HashSet::new(),
            live: 0,
            leveled: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn insert(&mut self, entry: WheelEntry) {
        self.live += 1;
        self.place(entry);
    }

    fn place(&mut self, entry: WheelEntry) {
        let delta = entry.fire_at_ms - self.origin_ms;
        if delta < TICK_MS {
            self.inner.push(Reverse(entry));
            return;
        }
        if delta >= wheel_span() {
            self.overflow.push(Reverse(entry));
            return;
        }
        for level in 0..LEVELS {
            if delta < slot_width(level) * SLOTS as i64 {
                let slot = (entry.fire_at_ms / slot_width(level)) as usize % SLOTS;
                self.levels[level][slot].push_back(entry);
                self.leveled += 1;
                return;
            }
        }
        unreachable!("delta bounded by wheel_span");
    }

    /// Drop a timer from the wheel without scanning buckets. The entry is
    /// skipped when its bucket drains.
    pub fn remove(&mut self, timer_id: Uuid) {
        self.tombstones.insert(timer_id);
    }

    /// Advance wheel time to `now_ms` and return every entry due by then,
    /// ordered by (fire instant, log index). All eligible entries come out in
    /// a single call regardless of which bucket held them.
    pub fn advance(&mut self, now_ms: i64) -> Vec<WheelEntry> {
        while self.origin_ms + TICK_MS <= now_ms {
            // Nothing in the buckets: jump straight to the next interesting
            // instant instead of rotating through empty slots.
            if self.inner.is_empty() && self.leveled == 0 {
                let target = self
                    .overflow
                    .peek()
                    .map(|Reverse(e)| e.fire_at_ms.min(now_ms))
                    .unwrap_or(now_ms);
                let aligned = target - target.rem_euclid(TICK_MS);
                if aligned > self.origin_ms {
                    self.origin_ms = aligned;
                }
            }
            if self.origin_ms + TICK_MS > now_ms {
                break;
            }
            self.origin_ms += TICK_MS;
            let ticks = self.origin_ms / TICK_MS;

            let slot0 = ticks as usize % SLOTS;
            while let Some(entry) = self.levels[0][slot0].pop_front() {
                self.leveled -= 1;
                self.inner.push(Reverse(entry));
            }

            for level in 1..LEVELS {
                if ticks % (SLOTS as i64).pow(level as u32) != 0 {
                    break;
                }
                let slot = (self.origin_ms / slot_width(level)) as usize % SLOTS;
                let drained: Vec<_> = self.levels[level][slot].drain(..).collect();
                self.leveled -= drained.len();
                for entry in drained {
                    self.place(entry);
                }
            }

            while self
                .overflow
                .peek()
                .map(|Reverse(e)| e.fire_at_ms - self.origin_ms < wheel_span())
                .unwrap_or(false)
            {
                let Reverse(entry) = self.overflow.pop().expect("peeked entry");
                self.place(entry);
            }
        }

        let mut due = Vec::new();
        while self
            .inner
            .peek()
            .map(|Reverse(e)| e.fire_at_ms <= now_ms)
            .unwrap_or(false)
        {
            let Reverse(entry) = self.inner.pop().expect("peeked entry");
            if self.tombstones.remove(&entry.timer_id) {
                self.live -= 1;
                continue;
            }
            self.live -= 1;
            due.push(entry);
        }
        due
    }

    /// Earliest instant anything could become due. The tick loop sleeps until
    /// this (capped by its own tick interval).
    pub fn next_deadline_ms(&self) -> Option<i64> {
        if let Some(Reverse(entry)) = self.inner.peek() {
            return Some(entry.fire_at_ms);
        }
        if self.live > 0 {
            return Some(self.origin_ms + TICK_MS);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fire_at_ms: i64, log_index: u64) -> WheelEntry {
        WheelEntry {
            fire_at_ms,
            log_index,
            timer_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn fires_in_instant_then_log_index_order() {
        let now = 1_000_000;
        let mut wheel = TimingWheel::new(now);
        let b = entry(now + 300, 7);
        let a = entry(now + 300, 3);
        let c = entry(now + 100, 9);
        wheel.insert(b);
        wheel.insert(a);
        wheel.insert(c);

        let due = wheel.advance(now + 600);
        assert_eq!(due, vec![c, a, b]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn nothing_fires_early() {
        let now = 2_000_000;
        let mut wheel = TimingWheel::new(now);
        wheel.insert(entry(now + 5_000, 1));

        assert!(wheel.advance(now + 4_999).is_empty());
        let due = wheel.advance(now + 5_000);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn cascades_from_outer_levels() {
        let now = 10_000_000;
        let mut wheel = TimingWheel::new(now);
        // One per level: inner slot, level 0, level 1, level 2, level 3.
        let offsets = [100, 1_000, 60_000, 30 * 60_000, 20 * 3_600_000];
        for (i, offset) in offsets.iter().enumerate() {
            wheel.insert(entry(now + offset, i as u64));
        }
        assert_eq!(wheel.len(), 5);

        let mut fired = Vec::new();
        let mut t = now;
        // Step in coarse increments well past the largest offset.
        while t < now + 21 * 3_600_000 {
            t += 10 * 60_000;
            for e in wheel.advance(t) {
                assert!(e.fire_at_ms <= t, "entry fired before due");
                fired.push(e.log_index);
            }
        }
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn far_future_entries_live_in_overflow_until_rotation() {
        let now = 0;
        let mut wheel = TimingWheel::new(now);
        let far = wheel_span() + 120_000;
        wheel.insert(entry(far, 1));
        assert_eq!(wheel.len(), 1);

        assert!(wheel.advance(far - TICK_MS).is_empty());
        let due = wheel.advance(far + TICK_MS);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn removed_entries_never_fire() {
        let now = 5_000_000;
        let mut wheel = TimingWheel::new(now);
        let doomed = entry(now + 400, 1);
        let kept = entry(now + 400, 2);
        wheel.insert(doomed);
        wheel.insert(kept);
        wheel.remove(doomed.timer_id);

        let due = wheel.advance(now + 1_000);
        assert_eq!(due, vec![kept]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn next_deadline_tracks_inner_heap_and_pending_buckets() {
        let now = 3_000_000;
        let mut wheel = TimingWheel::new(now);
        assert_eq!(wheel.next_deadline_ms(), None);

        wheel.insert(entry(now + 90, 1));
        assert_eq!(wheel.next_deadline_ms(), Some(now + 90));

        let mut wheel = TimingWheel::new(now);
        wheel.insert(entry(now + 10_000, 1));
        let deadline = wheel.next_deadline_ms().expect("deadline");
        assert!(deadline <= now + TICK_MS);
    }

    #[test]
    fn past_entries_are_due_immediately() {
        let now = 8_000_000;
        let mut wheel = TimingWheel::new(now);
        wheel.insert(entry(now - 30_000, 1));
        let due = wheel.advance(now);
        assert_eq!(due.len(), 1);
    }
}
