use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ShellError;

/// Cap on pids per sampling request.
pub const MAX_PROCESSES: usize = 100;

/// Freshness window for per-pid cached samples.
const CACHE_TTL: Duration = Duration::from_secs(5);

/// Consecutive sampler failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 3;

/// How long an open breaker serves cached data only.
const BREAKER_OPEN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub mem_mb: f64,
    pub mem_percent: f64,
}

/// The OS-level sampling seam. Production uses [`PsSampler`]; tests inject
/// scripted fakes.
#[async_trait]
pub trait ProcessSampler: Send + Sync {
    async fn sample(&self, pids: &[u32]) -> Result<HashMap<u32, ResourceSample>, ShellError>;
}

/// Samples all requested pids in one `ps` invocation.
pub struct PsSampler;

#[async_trait]
impl ProcessSampler for PsSampler {
    async fn sample(&self, pids: &[u32]) -> Result<HashMap<u32, ResourceSample>, ShellError> {
        if pids.is_empty() {
            return Ok(HashMap::new());
        }
        let pid_list = pids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let output = tokio::process::Command::new("ps")
            .args(["-o", "pid=,%cpu=,rss=,%mem=", "-p", &pid_list])
            .output()
            .await
            .map_err(|e| ShellError::Spawn(e.to_string()))?;

        // ps exits non-zero when some pids are already gone; parse whatever
        // rows came back regardless.
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Tolerant `ps` row parser: unparsable rows are skipped, negative values
/// clamped to zero.
fn parse_ps_output(text: &str) -> HashMap<u32, ResourceSample> {
    let mut samples = HashMap::new();
    for row in text.lines() {
        let mut fields = row.split_whitespace();
        let (Some(pid), Some(cpu), Some(rss), Some(mem)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Ok(pid) = pid.parse::<u32>() else { continue };
        let Ok(cpu) = cpu.parse::<f64>() else { continue };
        let Ok(rss_kb) = rss.parse::<f64>() else {
            continue;
        };
        let Ok(mem) = mem.parse::<f64>() else { continue };
        samples.insert(
            pid,
            ResourceSample {
                cpu_percent: cpu.max(0.0),
                mem_mb: (rss_kb / 1024.0).max(0.0),
                mem_percent: mem.max(0.0),
            },
        );
    }
    samples
}

struct Breaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Batched per-pid CPU/memory sampling with a short-TTL cache and a circuit
/// breaker around the external sampler. While the breaker is open only
/// cached data is returned.
pub struct ResourceSampler {
    sampler: Box<dyn ProcessSampler>,
    cache: Mutex<HashMap<u32, (Instant, ResourceSample)>>,
    breaker: Mutex<Breaker>,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new(Box::new(PsSampler))
    }
}

impl ResourceSampler {
    pub fn new(sampler: Box<dyn ProcessSampler>) -> Self {
        Self {
            sampler,
            cache: Mutex::new(HashMap::new()),
            breaker: Mutex::new(Breaker {
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub async fn sample_processes(&self, pids: &[u32]) -> HashMap<u32, ResourceSample> {
        let pids = if pids.len() > MAX_PROCESSES {
            tracing::warn!(
                requested = pids.len(),
                "sampling request capped to {MAX_PROCESSES} pids"
            );
            &pids[..MAX_PROCESSES]
        } else {
            pids
        };

        let mut results = HashMap::new();
        let mut stale: Vec<u32> = Vec::new();
        {
            let cache = self.cache.lock().expect("sampler cache poisoned");
            for &pid in pids {
                match cache.get(&pid) {
                    Some((at, sample)) if at.elapsed() < CACHE_TTL => {
                        results.insert(pid, *sample);
                    }
                    _ => stale.push(pid),
                }
            }
        }

        if stale.is_empty() || self.breaker_open() {
            return results;
        }

        match self.sampler.sample(&stale).await {
            Ok(fresh) => {
                {
                    let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
                    breaker.consecutive_failures = 0;
                    breaker.opened_at = None;
                }
                let now = Instant::now();
                let mut cache = self.cache.lock().expect("sampler cache poisoned");
                for (pid, sample) in fresh {
                    cache.insert(pid, (now, sample));
                    results.insert(pid, sample);
                }
                // Gone pids fall out of the cache so it cannot grow unbounded.
                cache.retain(|_, (at, _)| at.elapsed() < CACHE_TTL * 4);
            }
            Err(e) => {
                let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= BREAKER_THRESHOLD && breaker.opened_at.is_none()
                {
                    tracing::warn!(
                        failures = breaker.consecutive_failures,
                        "resource sampler circuit opened for {}s: {e}",
                        BREAKER_OPEN.as_secs()
                    );
                    breaker.opened_at = Some(Instant::now());
                }
            }
        }

        results
    }

    fn breaker_open(&self) -> bool {
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        match breaker.opened_at {
            Some(at) if at.elapsed() < BREAKER_OPEN => true,
            Some(_) => {
                // Open period elapsed: allow a trial call.
                breaker.opened_at = None;
                breaker.consecutive_failures = BREAKER_THRESHOLD - 1;
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_skips_garbage_rows() {
        let text = "  123 1.5 2048 0.3\nnot a row\n  456 bad 10 0.1\n  789 0.0 1024 0.2\n";
        let samples = parse_ps_output(text);
        assert_eq!(samples.len(), 2);
        assert!((samples[&123].mem_mb - 2.0).abs() < 1e-9);
        assert!(samples.contains_key(&789));
    }

    #[test]
    fn parser_clamps_negative_values() {
        let samples = parse_ps_output("  42 -1.0 -512 -0.5\n");
        let s = &samples[&42];
        assert_eq!(s.cpu_percent, 0.0);
        assert_eq!(s.mem_mb, 0.0);
        assert_eq!(s.mem_percent, 0.0);
    }

    struct FailingSampler;

    #[async_trait]
    impl ProcessSampler for FailingSampler {
        async fn sample(
            &self,
            _pids: &[u32],
        ) -> Result<HashMap<u32, ResourceSample>, ShellError> {
            Err(ShellError::Other("ps unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn breaker_opens_after_three_failures() {
        let sampler = ResourceSampler::new(Box::new(FailingSampler));
        for _ in 0..3 {
            let out = sampler.sample_processes(&[1]).await;
            assert!(out.is_empty());
        }
        assert!(sampler.breaker_open());
    }

    struct CountingSampler {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl ProcessSampler for CountingSampler {
        async fn sample(&self, pids: &[u32]) -> Result<HashMap<u32, ResourceSample>, ShellError> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(pids
                .iter()
                .map(|&p| {
                    (
                        p,
                        ResourceSample {
                            cpu_percent: 1.0,
                            mem_mb: 1.0,
                            mem_percent: 1.0,
                        },
                    )
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn fresh_cache_entries_skip_the_sampler() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sampler = ResourceSampler::new(Box::new(CountingSampler {
            calls: calls.clone(),
        }));
        let first = sampler.sample_processes(&[1, 2]).await;
        assert_eq!(first.len(), 2);
        let second = sampler.sample_processes(&[1, 2]).await;
        assert_eq!(second.len(), 2);
        // One batched call for the first request, none for the second.
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
