//! Stampede-mitigating retry proxy.
//!
//! Wraps any [`CachePool`] and re-reads a missing single key according to
//! a statistical interval distribution, so that out of many callers
//! missing at once one proceeds to compute the value while the rest poll
//! for its arrival instead of recomputing. Multi-key reads, writes, and
//! deletes pass straight through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::error::PoolResult;
use crate::pool::{CachePool, PoolCommand};

/// How re-reads of a missing key are spread over the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Give up after the first miss.
    NoRetry,
    /// A uniformly drawn number of evenly spaced retries, possibly none.
    FlatEvenIntervals,
    /// Evenly spread misses on average, with intervals growing
    /// geometrically so most of the final mass lands near the budget end.
    FlatGeometricIntervals,
    /// Evenly spaced retries over a randomly shrunk sub-budget.
    FlatRandomIntervals,
    /// Every interval drawn uniformly; total retry time clusters around
    /// half the budget.
    NormalRandomIntervals,
    /// The full retry schedule every time; all misses at the budget end.
    DeltaEvenIntervals,
    /// Each evenly spaced slot re-reads with probability `factor / N`.
    BinomialEvenIntervals,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::FlatGeometricIntervals
    }
}

/// One planned slot of the retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Step {
    sleep: Duration,
    read: bool,
}

/// Pool proxy that retries single-key reads on miss.
pub struct RetryingPool {
    inner: Arc<dyn CachePool>,
    config: RetryConfig,
}

impl RetryingPool {
    /// Wrap `inner` with the given retry configuration.
    ///
    /// Never fails: invalid parameters log a warning and disable
    /// retries, leaving a transparent proxy.
    pub fn new(inner: Arc<dyn CachePool>, config: RetryConfig) -> Self {
        Self {
            inner,
            config: validate(config),
        }
    }

    /// The strategy actually in effect, after validation.
    pub fn strategy(&self) -> RetryStrategy {
        self.config.strategy
    }
}

fn validate(mut config: RetryConfig) -> RetryConfig {
    let n = config.max_retries;
    let rejection = if config.timeout_ms < 1 {
        Some("timeout must be at least 1ms")
    } else {
        match config.strategy {
            RetryStrategy::FlatGeometricIntervals if config.factor <= 0.0 => {
                Some("geometric factor must be positive")
            }
            RetryStrategy::BinomialEvenIntervals
                if config.factor < 0.0 || config.factor > f64::from(n) =>
            {
                Some("binomial factor must lie in [0, max_retries]")
            }
            _ => None,
        }
    };
    if let Some(reason) = rejection {
        log::warn!("invalid retry configuration ({}); disabling retries", reason);
        config.strategy = RetryStrategy::NoRetry;
    }
    config
}

/// Draw the retry schedule for one read. All randomness happens here,
/// before the first sleep.
fn build_plan(config: &RetryConfig, rng: &mut impl Rng) -> Vec<Step> {
    let n = config.max_retries;
    if n == 0 || config.strategy == RetryStrategy::NoRetry {
        return Vec::new();
    }
    let budget = config.timeout();
    let step = budget / n;

    match config.strategy {
        RetryStrategy::NoRetry => Vec::new(),
        RetryStrategy::FlatEvenIntervals => {
            let planned = rng.gen_range(0..=n);
            (0..planned).map(|_| Step { sleep: step, read: true }).collect()
        }
        RetryStrategy::DeltaEvenIntervals => {
            (0..n).map(|_| Step { sleep: step, read: true }).collect()
        }
        RetryStrategy::FlatRandomIntervals => {
            let sub = budget.mul_f64(rng.gen::<f64>());
            let step = sub / n;
            (0..n).map(|_| Step { sleep: step, read: true }).collect()
        }
        RetryStrategy::NormalRandomIntervals => (0..n)
            .map(|_| Step {
                sleep: step.mul_f64(rng.gen::<f64>()),
                read: true,
            })
            .collect(),
        RetryStrategy::FlatGeometricIntervals => {
            // Intervals grow by `factor` and sum to the budget; the stop
            // threshold is drawn uniformly, so the proportion of callers
            // polling all the way to the end matches the weight of the
            // last interval.
            let threshold = budget.mul_f64(rng.gen::<f64>());
            let factor = config.factor;
            let base = if (factor - 1.0).abs() < f64::EPSILON {
                step
            } else {
                budget.mul_f64((factor - 1.0) / (factor.powi(n as i32) - 1.0))
            };
            let mut plan = Vec::new();
            let mut next = base;
            let mut cumulative = Duration::ZERO;
            for _ in 0..n {
                plan.push(Step { sleep: next, read: true });
                cumulative += next;
                if cumulative >= threshold {
                    break;
                }
                next = next.mul_f64(factor);
            }
            plan
        }
        RetryStrategy::BinomialEvenIntervals => {
            let p = config.factor.clamp(0.0, f64::from(n)) / f64::from(n);
            (0..n)
                .map(|_| Step {
                    sleep: step,
                    read: rng.gen::<f64>() < p,
                })
                .collect()
        }
    }
}

/// Shrink the next planned sleep so cumulative sleep stays inside the
/// budget. `None` means the budget is already overdrawn.
fn adjust_interval(next: Duration, started: Instant, budget: Duration) -> Option<Duration> {
    let elapsed = started.elapsed();
    if elapsed + next <= budget {
        return Some(next);
    }
    budget.checked_sub(elapsed)
}

#[async_trait]
impl CachePool for RetryingPool {
    async fn get(&self, key: &str) -> PoolResult<Option<Vec<u8>>> {
        let found = self.inner.get(key).await?;
        if found.is_some() {
            return Ok(found);
        }

        let plan = build_plan(&self.config, &mut rand::thread_rng());
        if plan.is_empty() {
            return Ok(None);
        }
        let budget = self.config.timeout();
        let started = Instant::now();

        for (retry_no, step) in plan.into_iter().enumerate() {
            let Some(sleep) = adjust_interval(step.sleep, started, budget) else {
                log::warn!(
                    "retry budget exhausted before retry {}; check retry configuration",
                    retry_no + 1
                );
                break;
            };
            tokio::time::sleep(sleep).await;
            if step.read {
                let found = self.inner.get(key).await?;
                if found.is_some() {
                    return Ok(found);
                }
            }
        }
        Ok(None)
    }

    async fn get_many(&self, keys: &[String]) -> PoolResult<HashMap<String, Vec<u8>>> {
        self.inner.get_many(keys).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> PoolResult<bool> {
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> PoolResult<bool> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> PoolResult<bool> {
        self.inner.delete(keys).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> PoolResult<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn clear(&self, prefix: Option<&str>) -> PoolResult<bool> {
        self.inner.clear(prefix).await
    }

    async fn pipeline(&self, commands: Vec<PoolCommand>) -> PoolResult<Vec<bool>> {
        self.inner.pipeline(commands).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPool;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(strategy: RetryStrategy, timeout_ms: u64, n: u32, factor: f64) -> RetryConfig {
        RetryConfig {
            timeout_ms,
            max_retries: n,
            strategy,
            factor,
        }
    }

    fn total_sleep(plan: &[Step]) -> Duration {
        plan.iter().map(|s| s.sleep).sum()
    }

    #[test]
    fn test_delta_plan_is_full_schedule() {
        let mut rng = StdRng::seed_from_u64(7);
        let cfg = config(RetryStrategy::DeltaEvenIntervals, 1000, 4, 2.0);
        let plan = build_plan(&cfg, &mut rng);
        assert_eq!(plan.len(), 4);
        assert!(plan.iter().all(|s| s.read));
        assert_eq!(total_sleep(&plan), Duration::from_millis(1000));
    }

    #[test]
    fn test_flat_even_draws_zero_to_n() {
        let cfg = config(RetryStrategy::FlatEvenIntervals, 1000, 4, 2.0);
        let mut seen = std::collections::HashSet::new();
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = build_plan(&cfg, &mut rng);
            assert!(plan.len() <= 4);
            seen.insert(plan.len());
        }
        // Both extremes of the uniform draw must occur.
        assert!(seen.contains(&0));
        assert!(seen.contains(&4));
    }

    #[test]
    fn test_geometric_intervals_grow_and_fit_budget() {
        let cfg = config(RetryStrategy::FlatGeometricIntervals, 1000, 4, 2.0);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = build_plan(&cfg, &mut rng);
            assert!(!plan.is_empty());
            for pair in plan.windows(2) {
                assert!(pair[1].sleep >= pair[0].sleep);
            }
            assert!(total_sleep(&plan) <= Duration::from_millis(1001));
        }
    }

    #[test]
    fn test_every_strategy_fits_budget() {
        let strategies = [
            RetryStrategy::FlatEvenIntervals,
            RetryStrategy::FlatGeometricIntervals,
            RetryStrategy::FlatRandomIntervals,
            RetryStrategy::NormalRandomIntervals,
            RetryStrategy::DeltaEvenIntervals,
            RetryStrategy::BinomialEvenIntervals,
        ];
        for strategy in strategies {
            for seed in 0..100 {
                let mut rng = StdRng::seed_from_u64(seed);
                let cfg = config(strategy, 500, 5, 2.0);
                let plan = build_plan(&cfg, &mut rng);
                assert!(
                    total_sleep(&plan) <= Duration::from_millis(501),
                    "{:?} overshoots its budget",
                    strategy
                );
            }
        }
    }

    #[test]
    fn test_binomial_probability_extremes() {
        let mut rng = StdRng::seed_from_u64(11);
        let none = build_plan(
            &config(RetryStrategy::BinomialEvenIntervals, 1000, 4, 0.0),
            &mut rng,
        );
        assert!(none.iter().all(|s| !s.read));

        let all = build_plan(
            &config(RetryStrategy::BinomialEvenIntervals, 1000, 4, 4.0),
            &mut rng,
        );
        assert!(all.iter().all(|s| s.read));
    }

    #[test]
    fn test_validation_degrades_to_no_retry() {
        let degraded = validate(config(RetryStrategy::FlatGeometricIntervals, 0, 4, 2.0));
        assert_eq!(degraded.strategy, RetryStrategy::NoRetry);

        let degraded = validate(config(RetryStrategy::FlatGeometricIntervals, 1000, 4, 0.0));
        assert_eq!(degraded.strategy, RetryStrategy::NoRetry);

        let degraded = validate(config(RetryStrategy::BinomialEvenIntervals, 1000, 4, 9.0));
        assert_eq!(degraded.strategy, RetryStrategy::NoRetry);

        let kept = validate(config(RetryStrategy::BinomialEvenIntervals, 1000, 4, 3.0));
        assert_eq!(kept.strategy, RetryStrategy::BinomialEvenIntervals);
    }

    #[test]
    fn test_adjust_interval_clamps_to_remaining() {
        let started = Instant::now();
        let budget = Duration::from_millis(100);
        // Well within budget: unchanged.
        assert_eq!(
            adjust_interval(Duration::from_millis(10), started, budget),
            Some(Duration::from_millis(10))
        );
        // Overshooting: clamped to what is left.
        let clamped = adjust_interval(Duration::from_millis(500), started, budget).unwrap();
        assert!(clamped <= budget);
    }

    #[tokio::test]
    async fn test_hit_needs_no_retry() {
        let pool = Arc::new(MemoryPool::new());
        pool.set("k", b"v", None).await.unwrap();
        let proxy = RetryingPool::new(pool, RetryConfig::default());

        let started = Instant::now();
        assert_eq!(proxy.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_retry_picks_up_late_value() {
        let pool = Arc::new(MemoryPool::new());
        let proxy = RetryingPool::new(
            pool.clone(),
            config(RetryStrategy::DeltaEvenIntervals, 400, 4, 2.0),
        );

        let writer = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            writer.set("late", b"v", None).await.unwrap();
        });

        let started = Instant::now();
        let found = proxy.get("late").await.unwrap();
        assert_eq!(found, Some(b"v".to_vec()));
        assert!(started.elapsed() <= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn test_miss_stays_within_budget() {
        let pool = Arc::new(MemoryPool::new());
        let proxy = RetryingPool::new(
            pool,
            config(RetryStrategy::DeltaEvenIntervals, 200, 4, 2.0),
        );

        let started = Instant::now();
        assert_eq!(proxy.get("absent").await.unwrap(), None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(190));
        assert!(elapsed <= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_writes_are_forwarded_untouched() {
        let pool = Arc::new(MemoryPool::new());
        let proxy = RetryingPool::new(pool.clone(), RetryConfig::default());

        assert!(proxy.set("a", b"1", None).await.unwrap());
        assert!(!proxy.set_if_absent("a", b"2", None).await.unwrap());
        assert!(proxy.delete(&["a".to_string()]).await.unwrap());
        assert!(pool.get("a").await.unwrap().is_none());
    }
}
