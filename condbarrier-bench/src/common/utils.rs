use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use ordered_float::OrderedFloat;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;

pub fn init_logging(max_level: &str) {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(max_level));
}

#[derive(Serialize, Debug)]
pub struct HistogramStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Mapping from percentile label (e.g., "p90", "p999") to value.
    pub percentiles: BTreeMap<String, f64>,
}

impl HistogramStats {
    pub fn compute(samples: &[OrderedFloat<f64>]) -> Self {
        let len = samples.len();
        if len == 0 {
            return Self {
                count: 0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                percentiles: BTreeMap::new(),
            };
        }
        let mut values: Vec<OrderedFloat<f64>> = samples.to_vec();
        values.sort();

        let mean = values.iter().map(|v| v.into_inner()).sum::<f64>() / len as f64;
        let percentile = |pct: f64| -> f64 {
            let idx = ((pct / 100.0) * (len as f64 - 1.0)).round() as usize;
            values[idx].into_inner()
        };

        const PCTS: &[(f64, &str)] = &[
            (50.0, "p50"),
            (90.0, "p90"),
            (99.0, "p99"),
            (99.9, "p999"),
        ];
        let percentiles = PCTS
            .iter()
            .map(|(pct, label)| (label.to_string(), percentile(*pct)))
            .collect();

        Self {
            count: len,
            min: values[0].into_inner(),
            max: values[len - 1].into_inner(),
            mean,
            percentiles,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct MetricDump {
    pub name: String,
    /// Labels attached to the metric, e.g. `manager`.
    pub labels: BTreeMap<String, String>,
    /// For counters and gauges, holds the raw numeric value. `None` for histograms.
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<HistogramStats>,
}

/// Installs a process-wide debugging recorder and turns its snapshots into
/// serializable dumps.
pub struct MetricsRecorder {
    snapshotter: Snapshotter,
}

impl MetricsRecorder {
    pub fn install() -> anyhow::Result<Self> {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .map_err(|_| anyhow::anyhow!("a metrics recorder is already installed"))?;
        Ok(Self { snapshotter })
    }

    pub fn snapshot(&self) -> Vec<MetricDump> {
        let mut dumps: Vec<MetricDump> = self
            .snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(ckey, _unit, _description, value)| {
                let key = ckey.key();
                let labels = key
                    .labels()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect();
                let (value, histogram) = match value {
                    DebugValue::Counter(v) => (Some(v as f64), None),
                    DebugValue::Gauge(v) => (Some(v.into_inner()), None),
                    DebugValue::Histogram(samples) => (None, Some(HistogramStats::compute(&samples))),
                };
                MetricDump {
                    name: key.name().to_owned(),
                    labels,
                    value,
                    histogram,
                }
            })
            .collect();
        dumps.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        dumps
    }

    /// Sum of a counter or gauge over every label set.
    pub fn total(&self, name: &str) -> f64 {
        self.snapshot()
            .iter()
            .filter(|d| d.name == name)
            .filter_map(|d| d.value)
            .sum()
    }

    /// Writes the snapshot as pretty JSON to `filename`, or stdout when empty.
    pub fn dump(&self, filename: &str) -> anyhow::Result<()> {
        let json_string = serde_json::to_string_pretty(&self.snapshot())?;
        if filename.is_empty() {
            println!("{}", json_string);
            return Ok(());
        }
        let mut file = File::create(filename)?;
        file.write_all(json_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_stats() {
        let samples: Vec<OrderedFloat<f64>> =
            (1..=100).rev().map(|v| OrderedFloat(v as f64)).collect();
        let stats = HistogramStats::compute(&samples);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert_eq!(stats.mean, 50.5);
        assert_eq!(stats.percentiles["p50"], 51.0);
        assert_eq!(stats.percentiles["p999"], 100.0);
    }

    #[test]
    fn test_empty_histogram() {
        let stats = HistogramStats::compute(&[]);
        assert_eq!(stats.count, 0);
        assert!(stats.percentiles.is_empty());
    }
}
