use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatewayError, Result};

/// Time-series retention per model
const MAX_SERIES_POINTS: usize = 1000;
/// Hourly buckets considered when deriving the usage trend
const TREND_WINDOWS: usize = 6;

const STATS_FILE: &str = "model_stats.json";
const SERIES_FILE: &str = "time_series.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageTrend {
    Increasing,
    Stable,
    Decreasing,
}

/// Rolling statistics for one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    /// User-satisfaction score, 0–5
    pub satisfaction: f64,
    pub rating_count: u64,
    pub last_used: DateTime<Utc>,
    pub trend: UsageTrend,
    /// Requests per UTC hour, most recent last
    window_counts: VecDeque<(i64, u64)>,
}

impl ModelStats {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            avg_latency_ms: 0.0,
            success_rate: 1.0,
            satisfaction: 0.0,
            rating_count: 0,
            last_used: now,
            trend: UsageTrend::Stable,
            window_counts: VecDeque::new(),
        }
    }
}

/// One time-series observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub tokens_per_second: f64,
    pub memory_mb: f64,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
}

/// Observations for a single completed request
#[derive(Debug, Clone, Default)]
pub struct RequestMetrics {
    pub latency_ms: u64,
    pub success: bool,
    pub tokens_per_second: f64,
    pub memory_mb: f64,
    /// 0–5 when the caller collected one
    pub rating: Option<f64>,
}

/// Append-only per-model statistics feeding routing hints.
///
/// State lives in concurrent maps; persistence is a whole-file JSON
/// snapshot rewritten after each update, so readers may observe a
/// slightly stale snapshot. A failed write is logged and dropped.
pub struct UsageAnalytics {
    stats: DashMap<String, ModelStats>,
    series: DashMap<String, VecDeque<MetricPoint>>,
    base_dir: PathBuf,
}

impl UsageAnalytics {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            stats: DashMap::new(),
            series: DashMap::new(),
            base_dir: base_dir.into(),
        }
    }

    /// Default location under the platform data directory
    pub fn with_default_dir() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llm-gateway")
            .join("analytics");
        Self::new(base)
    }

    /// Record one completed request and rewrite the snapshots
    pub fn record_request(&self, model: &str, metrics: &RequestMetrics) {
        let now = Utc::now();
        let hour = hour_bucket(now);

        {
            let mut stats = self
                .stats
                .entry(model.to_string())
                .or_insert_with(|| ModelStats::new(now));
            stats.total_requests += 1;
            if metrics.success {
                stats.successful_requests += 1;
            }
            let n = stats.total_requests as f64;
            stats.avg_latency_ms += (metrics.latency_ms as f64 - stats.avg_latency_ms) / n;
            stats.success_rate = stats.successful_requests as f64 / n;
            if let Some(rating) = metrics.rating {
                stats.rating_count += 1;
                let r = stats.rating_count as f64;
                stats.satisfaction += (rating.clamp(0.0, 5.0) - stats.satisfaction) / r;
            }
            stats.last_used = now;

            match stats.window_counts.back_mut() {
                Some((bucket, count)) if *bucket == hour => *count += 1,
                _ => stats.window_counts.push_back((hour, 1)),
            }
            while stats.window_counts.len() > TREND_WINDOWS {
                stats.window_counts.pop_front();
            }
            stats.trend = derive_trend(&stats.window_counts);
        }

        {
            let mut series = self.series.entry(model.to_string()).or_default();
            series.push_back(MetricPoint {
                timestamp: now,
                tokens_per_second: metrics.tokens_per_second,
                memory_mb: metrics.memory_mb,
                latency_ms: metrics.latency_ms,
                rating: metrics.rating,
            });
            while series.len() > MAX_SERIES_POINTS {
                series.pop_front();
            }
        }

        if let Err(e) = self.persist() {
            warn!(error = %e, "analytics snapshot write failed, dropping");
        }
    }

    /// Fold a later satisfaction rating into the stats
    pub fn record_rating(&self, model: &str, rating: f64) {
        if let Some(mut stats) = self.stats.get_mut(model) {
            stats.rating_count += 1;
            let r = stats.rating_count as f64;
            stats.satisfaction += (rating.clamp(0.0, 5.0) - stats.satisfaction) / r;
        }
        if let Err(e) = self.persist() {
            warn!(error = %e, "analytics snapshot write failed, dropping");
        }
    }

    pub fn stats_for(&self, model: &str) -> Option<ModelStats> {
        self.stats.get(model).map(|s| s.clone())
    }

    pub fn series_for(&self, model: &str) -> Vec<MetricPoint> {
        self.series
            .get(model)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tracked_models(&self) -> Vec<String> {
        self.stats.iter().map(|e| e.key().clone()).collect()
    }

    /// Rewrite both JSON snapshots (write-to-temp then rename)
    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .map_err(|e| GatewayError::Internal(format!("create analytics dir: {}", e)))?;

        let stats: std::collections::HashMap<String, ModelStats> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.write_snapshot(STATS_FILE, &stats)?;

        let series: std::collections::HashMap<String, Vec<MetricPoint>> = self
            .series
            .iter()
            .map(|e| (e.key().clone(), e.value().iter().cloned().collect()))
            .collect();
        self.write_snapshot(SERIES_FILE, &series)?;

        Ok(())
    }

    fn write_snapshot<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.base_dir.join(file);
        let tmp = self.base_dir.join(format!("{}.tmp", file));
        let json = serde_json::to_vec_pretty(value)?;
        fs::write(&tmp, json)
            .map_err(|e| GatewayError::Internal(format!("write {}: {}", file, e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| GatewayError::Internal(format!("rename {}: {}", file, e)))?;
        Ok(())
    }

    /// Load previously persisted snapshots, ignoring missing files
    pub fn load(&self) -> Result<()> {
        let stats_path = self.base_dir.join(STATS_FILE);
        if stats_path.exists() {
            let raw = fs::read_to_string(&stats_path)
                .map_err(|e| GatewayError::Internal(format!("read stats snapshot: {}", e)))?;
            let stats: std::collections::HashMap<String, ModelStats> = serde_json::from_str(&raw)?;
            for (model, value) in stats {
                self.stats.insert(model, value);
            }
        }

        let series_path = self.base_dir.join(SERIES_FILE);
        if series_path.exists() {
            let raw = fs::read_to_string(&series_path)
                .map_err(|e| GatewayError::Internal(format!("read series snapshot: {}", e)))?;
            let series: std::collections::HashMap<String, Vec<MetricPoint>> =
                serde_json::from_str(&raw)?;
            for (model, points) in series {
                self.series.insert(model, points.into_iter().collect());
            }
        }

        Ok(())
    }
}

fn hour_bucket(now: DateTime<Utc>) -> i64 {
    now.timestamp() / 3600
}

/// Compare the latest window against the average of the preceding ones,
/// with 20% hysteresis either way.
fn derive_trend(windows: &VecDeque<(i64, u64)>) -> UsageTrend {
    if windows.len() < 2 {
        return UsageTrend::Stable;
    }
    let (latest, earlier) = {
        let latest = windows.back().map(|(_, c)| *c).unwrap_or(0) as f64;
        let earlier: Vec<u64> = windows.iter().take(windows.len() - 1).map(|(_, c)| *c).collect();
        let avg = earlier.iter().sum::<u64>() as f64 / earlier.len() as f64;
        (latest, avg)
    };
    if earlier == 0.0 {
        return UsageTrend::Stable;
    }
    if latest > earlier * 1.2 {
        UsageTrend::Increasing
    } else if latest < earlier * 0.8 {
        UsageTrend::Decreasing
    } else {
        UsageTrend::Stable
    }
}
