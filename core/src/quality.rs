//! Quality monitoring: per-role thresholds, trend analysis over recent
//! metrics, and improvement recommendations.

use crate::task::AgentMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Metrics snapshots considered for trend analysis.
const TREND_WINDOW: usize = 10;

/// Recommendations kept per report.
const RECOMMENDATION_LIMIT: usize = 5;

/// Roles whose results warrant source-credibility checks.
const SOURCE_SENSITIVE_ROLES: [&str; 5] =
    ["research", "scientific", "medical", "legal", "financial"];

/// Categories of improvement a recommendation can suggest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ErrorHandling,
    Latency,
    Quality,
    SourceValidation,
    PromptRefinement,
    ResourceOptimization,
}

/// One improvement recommendation.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub description: String,
    /// 1-5, 5 highest.
    pub priority: u8,
    /// Expected quality improvement in [0, 1].
    pub estimated_impact: f64,
    pub steps: Vec<String>,
}

/// Trend slopes over the recent metrics history.
#[derive(Debug, Clone, Serialize)]
pub struct TrendSummary {
    pub quality_slope: f64,
    pub latency_slope: f64,
    pub success_slope: f64,
    pub quality_improving: bool,
    pub latency_improving: bool,
    pub success_improving: bool,
}

/// Quality report for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub agent_id: String,
    pub role: String,
    pub timestamp: DateTime<Utc>,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub average_quality: f64,
    pub meets_threshold: bool,
    pub threshold: f64,
    pub task_count: u64,
    pub recommendations: Vec<Recommendation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trends: Option<TrendSummary>,
}

/// System-wide quality summary.
#[derive(Debug, Clone, Serialize)]
pub struct SystemQualitySummary {
    pub timestamp: DateTime<Utc>,
    pub total_agents: usize,
    pub total_tasks: u64,
    pub average_success_rate: f64,
    pub average_quality: f64,
    pub agents_meeting_threshold: usize,
    pub top_recommendations: Vec<(String, Recommendation)>,
}

#[derive(Debug, Clone, Copy)]
struct MetricsSample {
    quality: f64,
    latency_ms: f64,
    success_rate: f64,
}

/// Monitors agent quality against per-role thresholds.
pub struct QualityMonitor {
    quality_thresholds: HashMap<String, f64>,
    latency_thresholds: HashMap<String, f64>,
    default_quality_threshold: f64,
    default_latency_threshold: f64,
    history: parking_lot::Mutex<HashMap<String, Vec<MetricsSample>>>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        let mut quality_thresholds = HashMap::new();
        for (role, threshold) in [
            ("research", 0.85),
            ("scientific", 0.90),
            ("medical", 0.95),
            ("legal", 0.92),
            ("financial", 0.93),
            ("specifications", 0.90),
            ("tester", 0.88),
            ("integrator", 0.92),
            ("optimizer", 0.85),
            ("devops", 0.90),
        ] {
            quality_thresholds.insert(role.to_string(), threshold);
        }

        let mut latency_thresholds = HashMap::new();
        for (role, limit) in [
            ("research", 2000.0),
            ("scientific", 3000.0),
            ("medical", 3000.0),
            ("legal", 3000.0),
            ("financial", 2500.0),
        ] {
            latency_thresholds.insert(role.to_string(), limit);
        }

        Self {
            quality_thresholds,
            latency_thresholds,
            default_quality_threshold: 0.80,
            default_latency_threshold: 1500.0,
            history: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Apply per-role threshold overrides.
    pub fn with_overrides(overrides: &HashMap<String, f64>) -> Self {
        let mut monitor = Self::new();
        for (role, threshold) in overrides {
            monitor
                .quality_thresholds
                .insert(role.clone(), *threshold);
        }
        monitor
    }

    pub fn threshold_for(&self, role: &str) -> f64 {
        self.quality_thresholds
            .get(role)
            .copied()
            .unwrap_or(self.default_quality_threshold)
    }

    pub fn latency_threshold_for(&self, role: &str) -> f64 {
        self.latency_thresholds
            .get(role)
            .copied()
            .unwrap_or(self.default_latency_threshold)
    }

    /// Record a metrics observation and produce a quality report with
    /// trends and recommendations.
    pub fn observe(&self, agent_id: &str, role: &str, metrics: &AgentMetrics) -> QualityReport {
        let threshold = self.threshold_for(role);
        let sample = MetricsSample {
            quality: metrics.average_quality(),
            latency_ms: metrics.average_latency_ms(),
            success_rate: metrics.success_rate(),
        };

        let trends = {
            let mut history = self.history.lock();
            let samples = history.entry(agent_id.to_string()).or_default();
            samples.push(sample);
            compute_trends(samples)
        };

        let recommendations =
            self.recommendations(role, metrics, threshold, trends.as_ref());

        let meets_threshold = sample.quality >= threshold;
        if !meets_threshold && !recommendations.is_empty() {
            tracing::info!(
                agent_id,
                role,
                quality = sample.quality,
                threshold,
                recommendations = recommendations.len(),
                "agent below quality threshold"
            );
        }

        QualityReport {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            timestamp: Utc::now(),
            success_rate: sample.success_rate,
            average_latency_ms: sample.latency_ms,
            average_quality: sample.quality,
            meets_threshold,
            threshold,
            task_count: metrics.task_count,
            recommendations,
            trends,
        }
    }

    fn recommendations(
        &self,
        role: &str,
        metrics: &AgentMetrics,
        threshold: f64,
        trends: Option<&TrendSummary>,
    ) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();
        let success_rate = metrics.success_rate();
        let average_quality = metrics.average_quality();
        let average_latency = metrics.average_latency_ms();

        if success_rate < 0.9 {
            recommendations.push(Recommendation {
                kind: RecommendationKind::ErrorHandling,
                description: format!(
                    "Success rate ({:.0}%) below target (90%)",
                    success_rate * 100.0
                ),
                priority: 5,
                estimated_impact: 0.1,
                steps: vec![
                    "Add retry logic for transient failures".to_string(),
                    "Improve error categorization".to_string(),
                    "Add fallback strategies".to_string(),
                ],
            });
        }

        let latency_limit = self.latency_threshold_for(role);
        if average_latency > latency_limit {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Latency,
                description: format!(
                    "Average latency ({average_latency:.0}ms) exceeds threshold ({latency_limit:.0}ms)"
                ),
                priority: 4,
                estimated_impact: 0.05,
                steps: vec![
                    "Optimize prompt generation".to_string(),
                    "Cache common responses".to_string(),
                    "Parallelize independent steps".to_string(),
                ],
            });
        }

        if average_quality < threshold {
            let gap = threshold - average_quality;
            if gap > 0.1 {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::PromptRefinement,
                    description: format!(
                        "Quality score ({average_quality:.2}) significantly below threshold ({threshold:.2})"
                    ),
                    priority: 5,
                    estimated_impact: gap * 0.7,
                    steps: vec![
                        "Refine prompts with more specific criteria".to_string(),
                        "Add example outputs to prompts".to_string(),
                        "Add a verification pass".to_string(),
                    ],
                });
            }
            if SOURCE_SENSITIVE_ROLES.contains(&role) {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::SourceValidation,
                    description: "Enhance source credibility validation".to_string(),
                    priority: 4,
                    estimated_impact: 0.08,
                    steps: vec![
                        "Rank sources by credibility".to_string(),
                        "Verify publication dates".to_string(),
                        "Cross-reference multiple sources".to_string(),
                    ],
                });
            }
        }

        if metrics.tokens_used > 0 && metrics.tokens_per_task() > 2000.0 {
            recommendations.push(Recommendation {
                kind: RecommendationKind::ResourceOptimization,
                description: format!(
                    "High token usage ({:.0} tokens/task)",
                    metrics.tokens_per_task()
                ),
                priority: 3,
                estimated_impact: 0.02,
                steps: vec![
                    "Shorten prompts".to_string(),
                    "Summarize context before inclusion".to_string(),
                    "Retrieve selectively".to_string(),
                ],
            });
        }

        if let Some(trends) = trends {
            if !trends.quality_improving {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::Quality,
                    description: "Quality trend declining over time".to_string(),
                    priority: 4,
                    estimated_impact: 0.05,
                    steps: vec![
                        "Review recent changes".to_string(),
                        "Analyze failure patterns".to_string(),
                    ],
                });
            }
        }

        recommendations.sort_by(|a, b| b.priority.cmp(&a.priority));
        recommendations.truncate(RECOMMENDATION_LIMIT);
        recommendations
    }

    /// Task-weighted summary across a set of reports, with the highest
    /// priority recommendations system-wide.
    pub fn system_summary(&self, reports: &[QualityReport]) -> SystemQualitySummary {
        let total_tasks: u64 = reports.iter().map(|r| r.task_count).sum();
        let weight = total_tasks.max(1) as f64;
        let average_success_rate = reports
            .iter()
            .map(|r| r.success_rate * r.task_count as f64)
            .sum::<f64>()
            / weight;
        let average_quality = reports
            .iter()
            .map(|r| r.average_quality * r.task_count as f64)
            .sum::<f64>()
            / weight;

        let mut top_recommendations: Vec<(String, Recommendation)> = reports
            .iter()
            .flat_map(|report| {
                report
                    .recommendations
                    .iter()
                    .map(|rec| (report.agent_id.clone(), rec.clone()))
            })
            .collect();
        top_recommendations.sort_by(|a, b| {
            b.1.priority
                .cmp(&a.1.priority)
                .then_with(|| b.1.estimated_impact.total_cmp(&a.1.estimated_impact))
        });
        top_recommendations.truncate(10);

        SystemQualitySummary {
            timestamp: Utc::now(),
            total_agents: reports.len(),
            total_tasks,
            average_success_rate,
            average_quality,
            agents_meeting_threshold: reports.iter().filter(|r| r.meets_threshold).count(),
            top_recommendations,
        }
    }
}

impl Default for QualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn compute_trends(samples: &[MetricsSample]) -> Option<TrendSummary> {
    if samples.len() < 2 {
        return None;
    }
    let recent = &samples[samples.len().saturating_sub(TREND_WINDOW)..];

    let quality_slope = slope(recent.iter().map(|s| s.quality));
    let latency_slope = slope(recent.iter().map(|s| s.latency_ms));
    let success_slope = slope(recent.iter().map(|s| s.success_rate));

    Some(TrendSummary {
        quality_slope,
        latency_slope,
        success_slope,
        quality_improving: quality_slope > 0.0,
        latency_improving: latency_slope < 0.0,
        success_improving: success_slope > 0.0,
    })
}

/// Least-squares slope of a series against its indices.
fn slope(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.collect();
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = values.iter().sum::<f64>() / n as f64;

    let numerator: f64 = values
        .iter()
        .enumerate()
        .map(|(i, y)| (i as f64 - x_mean) * (y - y_mean))
        .sum();
    let denominator: f64 = (0..n).map(|i| (i as f64 - x_mean).powi(2)).sum();

    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
