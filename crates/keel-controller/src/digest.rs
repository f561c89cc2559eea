use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::operation::job::JobType;

/// An online quantile estimator over a bounded multiplicative range,
/// backed by logarithmically spaced buckets. Used to calibrate memory
/// reserves from observed `actual / estimated` usage ratios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDigest {
    lower_bound: f64,
    upper_bound: f64,
    /// The multiplicative step between adjacent bucket boundaries.
    step: f64,
    default_value: f64,
    buckets: Vec<u64>,
    sample_count: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LogDigestConfig {
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub relative_precision: f64,
    pub default_value: f64,
}

impl LogDigest {
    pub fn new(config: LogDigestConfig) -> Self {
        debug_assert!(config.lower_bound > 0.0);
        debug_assert!(config.upper_bound >= config.lower_bound);
        debug_assert!(config.relative_precision > 0.0);
        let step = 1.0 + 2.0 * config.relative_precision;
        let bucket_count = ((config.upper_bound / config.lower_bound).ln() / step.ln()).ceil()
            .max(0.0) as usize
            + 1;
        Self {
            lower_bound: config.lower_bound,
            upper_bound: config.upper_bound,
            step,
            default_value: config.default_value,
            buckets: vec![0; bucket_count],
            sample_count: 0,
        }
    }

    pub fn add_sample(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let clamped = value.clamp(self.lower_bound, self.upper_bound);
        let index = ((clamped / self.lower_bound).ln() / self.step.ln()) as usize;
        let index = index.min(self.buckets.len() - 1);
        self.buckets[index] += 1;
        self.sample_count += 1;
    }

    /// Returns the smallest bucket upper boundary covering at least the
    /// requested fraction of samples, or the configured default when no
    /// samples have been added.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.sample_count == 0 {
            return self.default_value;
        }
        let threshold = (q * self.sample_count as f64).ceil() as u64;
        let mut seen = 0;
        for (index, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= threshold {
                let boundary = self.lower_bound * self.step.powi(index as i32 + 1);
                return boundary.clamp(self.lower_bound, self.upper_bound);
            }
        }
        self.upper_bound
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}

/// The per-job-type digests owned by one operation: one pair per job type,
/// covering job proxy overhead and user job memory independently.
#[derive(Debug, Serialize, Deserialize)]
pub struct DigestStore {
    job_proxy: HashMap<JobType, LogDigest>,
    user_job: HashMap<JobType, LogDigest>,
    job_proxy_reserve_quantile: f64,
    user_job_reserve_quantile: f64,
    job_proxy_precision: f64,
    user_job_precision: f64,
}

impl DigestStore {
    pub fn new(
        job_proxy_reserve_quantile: f64,
        user_job_reserve_quantile: f64,
        job_proxy_precision: f64,
        user_job_precision: f64,
    ) -> Self {
        Self {
            job_proxy: HashMap::new(),
            user_job: HashMap::new(),
            job_proxy_reserve_quantile,
            user_job_reserve_quantile,
            job_proxy_precision,
            user_job_precision,
        }
    }

    pub fn register_job_proxy_digest(&mut self, job_type: JobType) {
        let precision = self.job_proxy_precision;
        self.job_proxy.entry(job_type).or_insert_with(|| {
            LogDigest::new(LogDigestConfig {
                lower_bound: 0.5,
                upper_bound: 2.0,
                relative_precision: precision,
                default_value: 1.0,
            })
        });
    }

    /// The user job digest range is anchored at the operator-declared
    /// reserve factor: the reserve never drops below what was declared and
    /// never exceeds the full ask.
    pub fn register_user_job_digest(&mut self, job_type: JobType, memory_reserve_factor: f64) {
        let precision = self.user_job_precision;
        self.user_job.entry(job_type).or_insert_with(|| {
            LogDigest::new(LogDigestConfig {
                lower_bound: memory_reserve_factor,
                upper_bound: 1.0,
                relative_precision: precision,
                default_value: memory_reserve_factor,
            })
        });
    }

    pub fn job_proxy_factor(&self, job_type: JobType) -> f64 {
        self.job_proxy
            .get(&job_type)
            .map(|digest| digest.quantile(self.job_proxy_reserve_quantile))
            .unwrap_or(1.0)
    }

    pub fn user_job_factor(&self, job_type: JobType) -> f64 {
        self.user_job
            .get(&job_type)
            .map(|digest| digest.quantile(self.user_job_reserve_quantile))
            .unwrap_or(1.0)
    }

    pub fn sample_job_proxy(&mut self, job_type: JobType, factor: f64) {
        if let Some(digest) = self.job_proxy.get_mut(&job_type) {
            digest.add_sample(factor);
        }
    }

    pub fn sample_user_job(&mut self, job_type: JobType, factor: f64) {
        if let Some(digest) = self.user_job.get_mut(&job_type) {
            digest.add_sample(factor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> LogDigest {
        LogDigest::new(LogDigestConfig {
            lower_bound: 0.5,
            upper_bound: 2.0,
            relative_precision: 0.01,
            default_value: 1.0,
        })
    }

    #[test]
    fn test_empty_digest_returns_default() {
        let digest = digest();
        assert_eq!(digest.quantile(0.95), 1.0);
    }

    #[test]
    fn test_quantile_tracks_samples() {
        let mut digest = digest();
        for _ in 0..95 {
            digest.add_sample(0.6);
        }
        for _ in 0..5 {
            digest.add_sample(1.8);
        }
        let low = digest.quantile(0.5);
        assert!((low - 0.6).abs() / 0.6 < 0.05, "median estimate {low}");
        let high = digest.quantile(0.99);
        assert!((high - 1.8).abs() / 1.8 < 0.05, "tail estimate {high}");
    }

    #[test]
    fn test_samples_are_clamped_into_range() {
        let mut high = digest();
        high.add_sample(100.0);
        assert!(high.quantile(0.5) <= 2.0);

        let mut low = digest();
        low.add_sample(0.0001);
        assert!(low.quantile(0.01) >= 0.5);
    }

    #[test]
    fn test_store_defaults_and_updates() {
        let mut store = DigestStore::new(0.95, 0.95, 0.01, 0.01);
        store.register_job_proxy_digest(JobType::Map);
        store.register_user_job_digest(JobType::Map, 0.5);
        assert_eq!(store.job_proxy_factor(JobType::Map), 1.0);
        assert_eq!(store.user_job_factor(JobType::Map), 0.5);

        // Observed overshoot pushes the user job factor up.
        for _ in 0..20 {
            store.sample_user_job(JobType::Map, 0.9);
        }
        assert!(store.user_job_factor(JobType::Map) > 0.85);

        // An unregistered job type falls back to the uncalibrated factor.
        assert_eq!(store.job_proxy_factor(JobType::Partition), 1.0);
    }
}
