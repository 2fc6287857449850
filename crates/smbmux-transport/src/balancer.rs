//! Request placement across bonded channels.
//!
//! Only selectable (healthy) candidates are ever considered.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::channel::ChannelInfo;
use crate::config::LoadBalancing;

/// What the balancer needs to know about a channel.
pub trait Candidate {
    /// Whether the candidate may receive requests.
    fn is_selectable(&self) -> bool;
    /// Outstanding requests.
    fn load(&self) -> usize;
    /// Adaptive score; higher is better.
    fn score(&self) -> i64;
}

impl Candidate for ChannelInfo {
    fn is_selectable(&self) -> bool {
        ChannelInfo::is_selectable(self)
    }

    fn load(&self) -> usize {
        self.pending_count()
    }

    fn score(&self) -> i64 {
        ChannelInfo::score(self)
    }
}

impl<T: Candidate + ?Sized> Candidate for Arc<T> {
    fn is_selectable(&self) -> bool {
        (**self).is_selectable()
    }

    fn load(&self) -> usize {
        (**self).load()
    }

    fn score(&self) -> i64 {
        (**self).score()
    }
}

/// Picks a channel for each request according to a [`LoadBalancing`] policy.
#[derive(Debug)]
pub struct LoadBalancer {
    policy: LoadBalancing,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    /// Creates a balancer.
    pub fn new(policy: LoadBalancing) -> Self {
        Self { policy, cursor: AtomicUsize::new(0) }
    }

    /// Active policy.
    pub fn policy(&self) -> LoadBalancing {
        self.policy
    }

    /// Picks among the selectable `candidates`, or `None` if there are none.
    pub fn select<'a, C: Candidate>(&self, candidates: &'a [C]) -> Option<&'a C> {
        let usable: Vec<&C> = candidates.iter().filter(|c| c.is_selectable()).collect();
        if usable.is_empty() {
            return None;
        }

        match self.policy {
            LoadBalancing::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % usable.len();
                Some(usable[idx])
            }
            LoadBalancing::LeastLoaded => {
                // Rotate the start so ties spread across channels.
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % usable.len();
                usable
                    .iter()
                    .cycle()
                    .skip(start)
                    .take(usable.len())
                    .min_by_key(|c| c.load())
                    .copied()
            }
            LoadBalancing::AdaptiveScore => usable
                .iter()
                .max_by(|a, b| a.score().cmp(&b.score()).then_with(|| b.load().cmp(&a.load())))
                .copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Fake {
        name: &'static str,
        healthy: bool,
        load: usize,
        score: i64,
    }

    impl Candidate for Fake {
        fn is_selectable(&self) -> bool {
            self.healthy
        }
        fn load(&self) -> usize {
            self.load
        }
        fn score(&self) -> i64 {
            self.score
        }
    }

    fn fake(name: &'static str, healthy: bool, load: usize, score: i64) -> Fake {
        Fake { name, healthy, load, score }
    }

    #[test]
    fn test_none_when_no_healthy() {
        let lb = LoadBalancer::new(LoadBalancing::RoundRobin);
        let candidates = vec![fake("a", false, 0, 100)];
        assert!(lb.select(&candidates).is_none());
        assert!(lb.select::<Fake>(&[]).is_none());
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let lb = LoadBalancer::new(LoadBalancing::RoundRobin);
        let candidates = vec![fake("a", true, 0, 0), fake("b", false, 0, 0), fake("c", true, 0, 0)];
        let picks: Vec<_> = (0..4).map(|_| lb.select(&candidates).unwrap().name).collect();
        assert_eq!(picks, vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn test_least_loaded() {
        let lb = LoadBalancer::new(LoadBalancing::LeastLoaded);
        let candidates = vec![fake("a", true, 5, 0), fake("b", true, 1, 0), fake("c", false, 0, 0)];
        for _ in 0..3 {
            assert_eq!(lb.select(&candidates).unwrap().name, "b");
        }
    }

    #[test]
    fn test_adaptive_prefers_score_then_load() {
        let lb = LoadBalancer::new(LoadBalancing::AdaptiveScore);
        let candidates = vec![fake("a", true, 0, 90), fake("b", true, 3, 110), fake("c", true, 0, 110)];
        assert_eq!(lb.select(&candidates).unwrap().name, "c");
        let degraded_best = vec![fake("a", true, 0, 90), fake("b", false, 0, 500)];
        assert_eq!(lb.select(&degraded_best).unwrap().name, "a");
    }
}
