//! Statistical analysis over collected series
//!
//! Z-score anomaly detection, trend classification, and the per-service
//! health score used by operator-facing reports.

use crate::store::MetricSample;
use serde::Serialize;

/// One sample flagged as anomalous
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub timestamp: i64,
    pub value: f64,
    /// |z-score| / 2; 1.0 is the detection boundary
    pub score: f64,
}

/// Flag samples whose |z-score| exceeds 2.0 within the window
pub fn detect_anomalies(samples: &[MetricSample]) -> Vec<Anomaly> {
    if samples.len() < 2 {
        return Vec::new();
    }
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let mean = mean(&values);
    let stddev = stddev(&values, mean);
    if stddev == 0.0 {
        return Vec::new();
    }

    samples
        .iter()
        .filter_map(|sample| {
            let z = (sample.value - mean).abs() / stddev;
            (z > 2.0).then(|| Anomaly {
                timestamp: sample.timestamp,
                value: sample.value,
                score: z / 2.0,
            })
        })
        .collect()
}

/// Direction of a series over its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

/// Trend summary for one series
#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub direction: TrendDirection,
    pub avg_change_per_minute: f64,
    /// stddev / mean; 0 when the mean is 0
    pub volatility: f64,
    /// Linear extrapolation five minutes past the last sample, from the
    /// last five points; absent with fewer than two points
    pub forecast_5m: Option<f64>,
}

/// Analyze direction, change rate, volatility, and a short forecast.
/// Samples must be in ascending timestamp order.
pub fn analyze_trend(samples: &[MetricSample]) -> TrendReport {
    if samples.len() < 2 {
        return TrendReport {
            direction: TrendDirection::Stable,
            avg_change_per_minute: 0.0,
            volatility: 0.0,
            forecast_5m: None,
        };
    }

    let mut rising = 0usize;
    let mut falling = 0usize;
    for pair in samples.windows(2) {
        let delta = pair[1].value - pair[0].value;
        if delta > 0.0 {
            rising += 1;
        } else if delta < 0.0 {
            falling += 1;
        }
    }
    let direction = if rising > falling {
        TrendDirection::Increasing
    } else if falling > rising {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };

    let first = samples.first().unwrap();
    let last = samples.last().unwrap();
    let elapsed_minutes = (last.timestamp - first.timestamp) as f64 / 60.0;
    let avg_change_per_minute = if elapsed_minutes > 0.0 {
        (last.value - first.value) / elapsed_minutes
    } else {
        0.0
    };

    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let m = mean(&values);
    let volatility = if m != 0.0 { stddev(&values, m) / m } else { 0.0 };

    let tail = &samples[samples.len().saturating_sub(5)..];
    let forecast_5m = linear_forecast(tail, 300);

    TrendReport {
        direction,
        avg_change_per_minute,
        volatility,
        forecast_5m,
    }
}

/// Least-squares fit over the points, evaluated `horizon_secs` past the
/// last timestamp
fn linear_forecast(samples: &[MetricSample], horizon_secs: i64) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let xs: Vec<f64> = samples.iter().map(|s| s.timestamp as f64).collect();
    let ys: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let x_mean = mean(&xs);
    let y_mean = mean(&ys);

    let mut covariance = 0.0;
    let mut variance = 0.0;
    for i in 0..samples.len() {
        covariance += (xs[i] - x_mean) * (ys[i] - y_mean);
        variance += (xs[i] - x_mean) * (xs[i] - x_mean);
    }
    if variance == 0.0 {
        return None;
    }
    let slope = covariance / variance;
    let intercept = y_mean - slope * x_mean;
    let target = (samples.last().unwrap().timestamp + horizon_secs) as f64;
    Some(slope * target + intercept)
}

/// Qualitative health grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthGrade {
    Excellent,
    Good,
    Warning,
    Critical,
}

/// Weighted health score for one service
#[derive(Debug, Clone, Serialize)]
pub struct HealthScore {
    pub cpu_score: f64,
    pub memory_score: f64,
    pub response_time_score: f64,
    pub error_rate_score: f64,
    /// 0.3·cpu + 0.3·memory + 0.2·response + 0.2·error
    pub overall: f64,
    pub grade: HealthGrade,
    pub recommendations: Vec<String>,
}

/// Score a service from its latest observations
pub fn health_score(
    cpu_percent: f64,
    memory_percent: f64,
    response_time_ms: f64,
    error_rate_percent: f64,
) -> HealthScore {
    let cpu_score = (100.0 - cpu_percent).max(0.0);
    let memory_score = (100.0 - memory_percent).max(0.0);
    let response_time_score = (100.0 - response_time_ms / 10.0).max(0.0);
    let error_rate_score = (100.0 - error_rate_percent * 5.0).max(0.0);

    let overall = 0.3 * cpu_score
        + 0.3 * memory_score
        + 0.2 * response_time_score
        + 0.2 * error_rate_score;

    let grade = if overall >= 80.0 {
        HealthGrade::Excellent
    } else if overall >= 60.0 {
        HealthGrade::Good
    } else if overall >= 40.0 {
        HealthGrade::Warning
    } else {
        HealthGrade::Critical
    };

    let mut recommendations = Vec::new();
    if cpu_percent > 80.0 {
        recommendations.push("CPU usage is high; consider scaling out or profiling hot paths".into());
    }
    if memory_percent > 85.0 {
        recommendations.push("memory usage is high; check for leaks or raise limits".into());
    }
    if response_time_ms > 1000.0 {
        recommendations.push("response time exceeds 1s; investigate slow endpoints".into());
    }
    if error_rate_percent > 5.0 {
        recommendations.push("error rate exceeds 5%; inspect recent logs".into());
    }

    HealthScore {
        cpu_score,
        memory_score,
        response_time_score,
        error_rate_score,
        overall,
        grade,
        recommendations,
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn stddev(values: &[f64], mean: f64) -> f64 {
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64]) -> Vec<MetricSample> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| MetricSample::new("gw", "cpu_percent", *v, i as i64 * 60))
            .collect()
    }

    #[test]
    fn test_anomaly_detection_flags_outlier() {
        let mut values = vec![10.0; 20];
        values.push(100.0);
        let anomalies = detect_anomalies(&series(&values));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].value, 100.0);
        assert!(anomalies[0].score > 1.0);
    }

    #[test]
    fn test_flat_series_has_no_anomalies() {
        let anomalies = detect_anomalies(&series(&[5.0; 10]));
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_trend_increasing() {
        let report = analyze_trend(&series(&[10.0, 20.0, 30.0, 40.0, 50.0]));
        assert_eq!(report.direction, TrendDirection::Increasing);
        // 40 units over 4 minutes
        assert!((report.avg_change_per_minute - 10.0).abs() < 1e-9);
        // perfectly linear: forecast continues the line 5 minutes out
        assert!((report.forecast_5m.unwrap() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_trend_stable_on_alternation() {
        let report = analyze_trend(&series(&[10.0, 12.0, 10.0, 12.0, 10.0]));
        assert_eq!(report.direction, TrendDirection::Stable);
    }

    #[test]
    fn test_health_score_weights() {
        let score = health_score(50.0, 50.0, 500.0, 10.0);
        assert_eq!(score.cpu_score, 50.0);
        assert_eq!(score.response_time_score, 50.0);
        assert_eq!(score.error_rate_score, 50.0);
        assert!((score.overall - 50.0).abs() < 1e-9);
        assert_eq!(score.grade, HealthGrade::Warning);
        assert!(score.recommendations.iter().any(|r| r.contains("error rate")));
    }

    #[test]
    fn test_health_score_excellent() {
        let score = health_score(10.0, 20.0, 100.0, 0.0);
        assert_eq!(score.grade, HealthGrade::Excellent);
        assert!(score.recommendations.is_empty());
    }
}
