//! Harvest-time metric samplers
//!
//! Samplers are polled once per harvest cycle for process-level gauges that
//! no transaction produces. A failing sampler is logged and skipped; it
//! never aborts the harvest.

use std::fmt;
use std::time::SystemTime;

use crate::apm_warn;
use crate::stats::MetricName;

/// One value polled from a sampler at harvest time.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct SampledValue {
    /// Metric the value belongs to.
    pub name: MetricName,
    /// The polled value.
    pub value: f64,
}

impl SampledValue {
    /// Create a new `SampledValue`.
    pub fn new(name: impl Into<MetricName>, value: f64) -> Self {
        SampledValue {
            name: name.into(),
            value,
        }
    }
}

/// Interface for harvest-time gauges.
pub trait MetricSampler: Send + fmt::Debug {
    /// Name used when reporting sampler failures.
    fn name(&self) -> &'static str;

    /// Poll the sampler. Called once per harvest cycle, from the harvest
    /// thread.
    fn sample(&mut self) -> Result<Vec<SampledValue>, Box<dyn std::error::Error + Send + Sync>>;
}

const UPTIME_METRIC: MetricName = MetricName::from_static("Instance/Uptime");

/// Reports seconds since the application activated.
#[derive(Debug)]
pub struct UptimeSampler {
    started: SystemTime,
}

impl UptimeSampler {
    pub(crate) fn new(started: SystemTime) -> Self {
        UptimeSampler { started }
    }
}

impl MetricSampler for UptimeSampler {
    fn name(&self) -> &'static str {
        "uptime"
    }

    fn sample(&mut self) -> Result<Vec<SampledValue>, Box<dyn std::error::Error + Send + Sync>> {
        let uptime = crate::time::now()
            .duration_since(self.started)
            .unwrap_or_default();
        Ok(vec![SampledValue::new(
            UPTIME_METRIC,
            uptime.as_secs_f64(),
        )])
    }
}

/// Poll every sampler, isolating failures to the sampler that raised them.
pub(crate) fn poll_samplers(samplers: &mut [Box<dyn MetricSampler>]) -> Vec<SampledValue> {
    let mut values = Vec::new();
    for sampler in samplers.iter_mut() {
        match sampler.sample() {
            Ok(mut sampled) => values.append(&mut sampled),
            Err(err) => {
                apm_warn!(name: "sampler_failed", sampler = sampler.name(), error = format!("{err}"));
            }
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FailingSampler;

    impl MetricSampler for FailingSampler {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn sample(
            &mut self,
        ) -> Result<Vec<SampledValue>, Box<dyn std::error::Error + Send + Sync>> {
            Err("sampler device unavailable".into())
        }
    }

    #[test]
    fn uptime_reports_nonnegative_seconds() {
        let mut sampler = UptimeSampler::new(SystemTime::UNIX_EPOCH);
        let values = sampler.sample().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].name.as_str(), "Instance/Uptime");
        assert!(values[0].value >= 0.0);
    }

    #[test]
    fn failing_sampler_does_not_block_the_rest() {
        let mut samplers: Vec<Box<dyn MetricSampler>> = vec![
            Box::new(FailingSampler),
            Box::new(UptimeSampler::new(SystemTime::UNIX_EPOCH)),
        ];
        let values = poll_samplers(&mut samplers);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].name.as_str(), "Instance/Uptime");
    }
}
