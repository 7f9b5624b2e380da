//! Periodic task bookkeeping for the single-threaded driver loops.
//!
//! Each activity registers its own period once. The driver sleeps until
//! [`Scheduler::next_deadline`] and then runs whatever [`Scheduler::due`]
//! hands back. Periods that were missed while the loop was busy are skipped,
//! never replayed in a burst.

use std::time::{Duration, Instant};

struct Task<K> {
    key: K,
    period: Duration,
    next: Instant,
}

pub struct Scheduler<K> {
    tasks: Vec<Task<K>>,
}

impl<K: Copy + PartialEq> Scheduler<K> {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Register `key` to fire every `period`, first at `now + period`.
    pub fn every(&mut self, key: K, period: Duration, now: Instant) -> &mut Self {
        self.tasks.push(Task {
            key,
            period,
            next: now + period,
        });
        self
    }

    /// Register `key` to fire at `now` and then every `period`.
    pub fn every_from_now(&mut self, key: K, period: Duration, now: Instant) -> &mut Self {
        self.tasks.push(Task {
            key,
            period,
            next: now,
        });
        self
    }

    /// Earliest instant at which some task becomes due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.iter().map(|t| t.next).min()
    }

    /// Keys due at `now`, in registration order. Each due task is re-armed
    /// for its next period strictly after `now`.
    pub fn due(&mut self, now: Instant) -> Vec<K> {
        let mut fired = Vec::new();
        for task in &mut self.tasks {
            if task.next > now {
                continue;
            }
            fired.push(task.key);
            if task.period.is_zero() {
                task.next = now;
                continue;
            }
            let behind = now.duration_since(task.next);
            let skipped = (behind.as_nanos() / task.period.as_nanos()) as u32;
            task.next += task.period * (skipped + 1);
        }
        fired
    }
}

impl<K: Copy + PartialEq> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Job {
        Fast,
        Slow,
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn nothing_due_before_first_period() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        s.every(Job::Fast, secs(2), t0);
        assert!(s.due(t0 + Duration::from_millis(1999)).is_empty());
        assert_eq!(s.due(t0 + secs(2)), vec![Job::Fast]);
    }

    #[test]
    fn every_from_now_fires_immediately() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        s.every_from_now(Job::Slow, secs(30), t0);
        assert_eq!(s.due(t0), vec![Job::Slow]);
        assert!(s.due(t0 + secs(29)).is_empty());
    }

    #[test]
    fn tasks_fire_on_their_own_periods() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        s.every(Job::Fast, secs(2), t0).every(Job::Slow, secs(5), t0);

        let mut fast = 0;
        let mut slow = 0;
        for tick in 1..=10 {
            for job in s.due(t0 + secs(tick)) {
                match job {
                    Job::Fast => fast += 1,
                    Job::Slow => slow += 1,
                }
            }
        }
        assert_eq!(fast, 5);
        assert_eq!(slow, 2);
    }

    #[test]
    fn missed_periods_fire_once() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        s.every(Job::Fast, secs(1), t0);
        assert_eq!(s.due(t0 + secs(10)), vec![Job::Fast]);
        assert!(s.due(t0 + Duration::from_millis(10_500)).is_empty());
        assert_eq!(s.due(t0 + secs(11)), vec![Job::Fast]);
    }

    #[test]
    fn next_deadline_is_earliest_task() {
        let t0 = Instant::now();
        let mut s = Scheduler::new();
        assert_eq!(s.next_deadline(), None);
        s.every(Job::Slow, secs(30), t0).every(Job::Fast, secs(2), t0);
        assert_eq!(s.next_deadline(), Some(t0 + secs(2)));
    }
}
