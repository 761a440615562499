//! Slice compliance against the reference QoS targets.
//!
//! A pure validator: it reads measured [`NetworkSliceMetrics`] and the
//! reference targets of each [`SliceType`] and produces pass/fail
//! judgements, never touching its inputs.
//!
//! # Key Features
//!
//! - **Tolerance bands**: throughput passes at `actual >= target * (1 - T)`,
//!   latency at `actual <= target * (1 + T)`
//! - **Deploy ceiling**: a slice deployed in more than ten minutes fails the
//!   deploy sub-check
//! - **Per-slice and suite scores**: satisfied sub-checks over total, and the
//!   arithmetic mean across slices
//! - **Issues and recommendations**: slice-specific rules flag latency,
//!   reliability, consistency and overhead problems with a severity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tn_shared::slice::{rtt_targets, throughput_targets};
use tn_shared::{
    DEPLOY_TARGET_MS, NetworkSliceMetrics, PerformanceMetrics, SliceType, ThesisTarget,
    ThesisValidation,
};

pub const DEFAULT_TOLERANCE: f64 = 0.10;
pub const DEFAULT_COMPLIANCE_THRESHOLD: f64 = 80.0;

/// Per-slice score below which a slice is flagged even when the suite passes.
const SLICE_COMPLIANCE_FLOOR: f64 = 90.0;
const URLLC_LATENCY_CEILING_MS: f64 = 10.0;
const URLLC_LOSS_CEILING: f64 = 0.001;
const EMBB_THROUGHPUT_FLOOR_MBPS: f64 = 4.0;
const EMBB_VARIATION_CEILING_PERCENT: f64 = 20.0;
const MIOT_LATENCY_CEILING_MS: f64 = 20.0;
const MIOT_OVERHEAD_CEILING_PERCENT: f64 = 15.0;
const OVERHEAD_CEILING_PERCENT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

/// A problem found while validating a suite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceIssue {
    pub severity: Severity,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_type: Option<String>,
    pub description: String,
    pub impact: String,
    pub suggestion: String,
}

/// One measured run of a slice, reduced to the figures the rules look at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub test_id: String,
    pub success: bool,
    pub throughput_mbps: f64,
    pub latency_ms: f64,
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub overhead_percent: f64,
    pub deploy_time_ms: i64,
}

impl RunResult {
    fn from_metrics(metrics: &NetworkSliceMetrics) -> Self {
        let performance = &metrics.performance;
        Self {
            test_id: performance.test_id.clone(),
            success: performance.error_details.is_empty(),
            throughput_mbps: performance.throughput.avg_mbps,
            latency_ms: performance.latency.avg_rtt_ms,
            packet_loss: performance.packet_loss,
            jitter_ms: performance.jitter,
            overhead_percent: performance.tc_overhead + performance.vxlan_overhead,
            deploy_time_ms: metrics.thesis_validation.deploy_time_ms,
        }
    }
}

/// Compliance of one slice type against its reference target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceCompliance {
    pub slice_type: SliceType,
    pub target: ThesisTarget,
    pub actual_throughput_mbps: f64,
    pub actual_latency_ms: f64,
    pub deploy_time_ms: i64,
    pub throughput_met: bool,
    pub latency_met: bool,
    pub deploy_met: bool,
    pub passed_checks: u32,
    pub total_checks: u32,
    pub compliance_percent: f64,
    pub compliant: bool,
    /// Coefficient of variation of the run throughputs, in percent
    pub throughput_variation_percent: f64,
    pub runs: Vec<RunResult>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceSummary {
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub overall_compliance: f64,
    pub avg_deploy_time_ms: f64,
    pub avg_throughput_mbps: f64,
    pub avg_latency_ms: f64,
    pub max_overhead_percent: f64,
}

/// Result of validating a set of slices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    pub timestamp: DateTime<Utc>,
    pub tolerance: f64,
    pub threshold: f64,
    pub overall_compliance: f64,
    pub compliant: bool,
    pub slices: BTreeMap<String, SliceCompliance>,
    pub summary: ComplianceSummary,
    pub issues: Vec<ComplianceIssue>,
    pub recommendations: Vec<String>,
}

/// Validator configured with a tolerance fraction and a pass threshold in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplianceValidator {
    tolerance: f64,
    threshold: f64,
    deploy_ceiling_ms: i64,
}

impl Default for ComplianceValidator {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE, DEFAULT_COMPLIANCE_THRESHOLD)
    }
}

impl ComplianceValidator {
    pub fn new(tolerance: f64, threshold: f64) -> Self {
        Self {
            tolerance,
            threshold,
            deploy_ceiling_ms: DEPLOY_TARGET_MS,
        }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn throughput_met(&self, actual_mbps: f64, target_mbps: f64) -> bool {
        actual_mbps >= target_mbps * (1.0 - self.tolerance)
    }

    /// A latency of zero means nothing was measured and never passes.
    pub fn latency_met(&self, actual_ms: f64, target_ms: f64) -> bool {
        actual_ms > 0.0 && actual_ms <= target_ms * (1.0 + self.tolerance)
    }

    pub fn deploy_met(&self, deploy_time_ms: i64) -> bool {
        deploy_time_ms <= self.deploy_ceiling_ms
    }

    pub fn is_compliant(&self, compliance_percent: f64) -> bool {
        compliance_percent >= self.threshold
    }

    /// Score one aggregated measurement against a target.
    pub fn evaluate(&self, slice_type: SliceType, metrics: &NetworkSliceMetrics) -> SliceCompliance {
        self.evaluate_runs(slice_type, std::slice::from_ref(metrics))
    }

    /// Score several runs of one slice type. Throughput and latency are
    /// averaged over the successful runs; the deploy check uses the slowest
    /// deployment.
    pub fn evaluate_runs(&self, slice_type: SliceType, runs: &[NetworkSliceMetrics]) -> SliceCompliance {
        let target = slice_type.target();
        let runs: Vec<RunResult> = runs.iter().map(RunResult::from_metrics).collect();
        let successful: Vec<&RunResult> = runs.iter().filter(|r| r.success).collect();

        let throughputs: Vec<f64> = successful.iter().map(|r| r.throughput_mbps).collect();
        let latencies: Vec<f64> = successful
            .iter()
            .map(|r| r.latency_ms)
            .filter(|l| *l > 0.0)
            .collect();
        let actual_throughput_mbps = mean(&throughputs);
        let actual_latency_ms = mean(&latencies);
        let deploy_time_ms = runs.iter().map(|r| r.deploy_time_ms).max().unwrap_or(0);

        let throughput_met = !successful.is_empty()
            && self.throughput_met(actual_throughput_mbps, target.throughput_mbps);
        let latency_met = self.latency_met(actual_latency_ms, target.rtt_ms);
        let deploy_met = !runs.is_empty() && self.deploy_met(deploy_time_ms);

        let passed_checks = [throughput_met, latency_met, deploy_met]
            .iter()
            .filter(|met| **met)
            .count() as u32;
        let total_checks = 3;
        let compliance_percent = f64::from(passed_checks) / f64::from(total_checks) * 100.0;

        SliceCompliance {
            slice_type,
            target,
            actual_throughput_mbps,
            actual_latency_ms,
            deploy_time_ms,
            throughput_met,
            latency_met,
            deploy_met,
            passed_checks,
            total_checks,
            compliance_percent,
            compliant: self.is_compliant(compliance_percent),
            throughput_variation_percent: coefficient_of_variation(&throughputs),
            runs,
        }
    }

    /// Build the [`ThesisValidation`] attached to a multi-cluster test
    /// result. With a known slice type the aggregate is checked against that
    /// slice's target; otherwise only the deploy sub-check applies.
    pub fn thesis_validation(
        &self,
        slice_type: Option<SliceType>,
        aggregate: &PerformanceMetrics,
        cluster_metrics: &BTreeMap<String, PerformanceMetrics>,
        deploy_time_ms: i64,
    ) -> ThesisValidation {
        let mut passed = 0u32;
        let mut total = 0u32;
        let mut tally = |met: bool| {
            total += 1;
            if met {
                passed += 1;
            }
        };

        if let Some(slice_type) = slice_type {
            let target = slice_type.target();
            tally(self.throughput_met(aggregate.throughput.avg_mbps, target.throughput_mbps));
            tally(self.latency_met(aggregate.latency.avg_rtt_ms, target.rtt_ms));
        }
        tally(self.deploy_met(deploy_time_ms));

        ThesisValidation {
            throughput_targets: throughput_targets(),
            rtt_targets: rtt_targets(),
            throughput_results: cluster_metrics.values().map(|m| m.throughput.avg_mbps).collect(),
            rtt_results: cluster_metrics.values().map(|m| m.latency.avg_rtt_ms).collect(),
            passed_tests: passed,
            total_tests: total,
            compliance_percent: f64::from(passed) / f64::from(total) * 100.0,
            deploy_time_ms,
            deploy_target_ms: self.deploy_ceiling_ms,
        }
    }

    /// Combine per-slice results into a suite report.
    pub fn report(&self, slices: Vec<SliceCompliance>) -> ComplianceReport {
        let overall_compliance = mean(&slices.iter().map(|s| s.compliance_percent).collect::<Vec<_>>());
        let summary = summarize(&slices, overall_compliance);
        let issues = self.find_issues(&slices, &summary);
        let recommendations = recommendations(&issues);

        ComplianceReport {
            timestamp: Utc::now(),
            tolerance: self.tolerance,
            threshold: self.threshold,
            overall_compliance,
            compliant: !slices.is_empty() && self.is_compliant(overall_compliance),
            slices: slices
                .into_iter()
                .map(|s| (s.slice_type.as_str().to_string(), s))
                .collect(),
            summary,
            issues,
            recommendations,
        }
    }

    fn find_issues(&self, slices: &[SliceCompliance], summary: &ComplianceSummary) -> Vec<ComplianceIssue> {
        let mut issues = Vec::new();

        for slice in slices {
            let name = slice.slice_type.as_str();
            let issue = |severity, component: &str, description: String, impact: &str, suggestion: &str| {
                ComplianceIssue {
                    severity,
                    component: component.to_string(),
                    slice_type: Some(name.to_string()),
                    description,
                    impact: impact.to_string(),
                    suggestion: suggestion.to_string(),
                }
            };

            match slice.slice_type {
                SliceType::Urllc => {
                    if slice.actual_latency_ms > URLLC_LATENCY_CEILING_MS {
                        issues.push(issue(
                            Severity::Critical,
                            "latency",
                            format!(
                                "URLLC latency {:.2} ms exceeds {} ms",
                                slice.actual_latency_ms, URLLC_LATENCY_CEILING_MS
                            ),
                            "Ultra-low-latency services cannot meet their deadlines",
                            "Raise the URLLC class priority and remove netem delay on its path",
                        ));
                    }
                    for run in slice.runs.iter().filter(|r| r.packet_loss > URLLC_LOSS_CEILING) {
                        issues.push(issue(
                            Severity::High,
                            "reliability",
                            format!("URLLC run {} lost {:.4}% of packets", run.test_id, run.packet_loss),
                            "Reliability target of 99.999% is not met",
                            "Check for queue drops on the shaped interface and lower competing load",
                        ));
                    }
                }
                SliceType::Embb => {
                    if slice.actual_throughput_mbps < EMBB_THROUGHPUT_FLOOR_MBPS {
                        issues.push(issue(
                            Severity::High,
                            "throughput",
                            format!(
                                "eMBB throughput {:.2} Mbps is below {} Mbps",
                                slice.actual_throughput_mbps, EMBB_THROUGHPUT_FLOOR_MBPS
                            ),
                            "Broadband users see reduced data rates",
                            "Increase the eMBB class rate or its ceil",
                        ));
                    }
                    if slice.throughput_variation_percent > EMBB_VARIATION_CEILING_PERCENT {
                        issues.push(issue(
                            Severity::Medium,
                            "consistency",
                            format!(
                                "eMBB throughput varies by {:.1}% between runs",
                                slice.throughput_variation_percent
                            ),
                            "Delivered rate is unpredictable",
                            "Use a larger burst or isolate the slice from bursty neighbours",
                        ));
                    }
                }
                SliceType::Miot | SliceType::Mmtc => {
                    if slice.actual_latency_ms > MIOT_LATENCY_CEILING_MS {
                        issues.push(issue(
                            Severity::Medium,
                            "latency",
                            format!(
                                "{} latency {:.2} ms exceeds {} ms",
                                name, slice.actual_latency_ms, MIOT_LATENCY_CEILING_MS
                            ),
                            "Device reporting intervals may be missed",
                            "Review the netem delay configured for the IoT class",
                        ));
                    }
                    for run in slice
                        .runs
                        .iter()
                        .filter(|r| r.overhead_percent > MIOT_OVERHEAD_CEILING_PERCENT)
                    {
                        issues.push(issue(
                            Severity::Low,
                            "efficiency",
                            format!(
                                "run {} spends {:.1}% on tc and VXLAN overhead",
                                run.test_id, run.overhead_percent
                            ),
                            "Small IoT payloads are dominated by encapsulation",
                            "Raise the overlay MTU or drop unused filters",
                        ));
                    }
                }
            }

            if slice.compliance_percent < SLICE_COMPLIANCE_FLOOR {
                issues.push(issue(
                    Severity::Medium,
                    "slice-compliance",
                    format!(
                        "{} compliance {:.1}% is below {}%",
                        name, slice.compliance_percent, SLICE_COMPLIANCE_FLOOR
                    ),
                    "The slice does not consistently meet its reference profile",
                    "Tune the slice's bandwidth policy against its reference target",
                ));
            }
        }

        if !slices.is_empty() && summary.overall_compliance < self.threshold {
            issues.push(ComplianceIssue {
                severity: Severity::Critical,
                component: "overall".to_string(),
                slice_type: None,
                description: format!(
                    "overall compliance {:.1}% is below the {}% threshold",
                    summary.overall_compliance, self.threshold
                ),
                impact: "The deployment does not meet its reference targets".to_string(),
                suggestion: "Address the slice-level issues before accepting the deployment".to_string(),
            });
        }
        if summary.avg_deploy_time_ms > self.deploy_ceiling_ms as f64 {
            issues.push(ComplianceIssue {
                severity: Severity::High,
                component: "deployment".to_string(),
                slice_type: None,
                description: format!(
                    "average deployment took {:.0} ms, above {} ms",
                    summary.avg_deploy_time_ms, self.deploy_ceiling_ms
                ),
                impact: "Slices cannot be brought up within the ten-minute window".to_string(),
                suggestion: "Parallelize cluster configuration and check slow agents".to_string(),
            });
        }
        if summary.max_overhead_percent > OVERHEAD_CEILING_PERCENT {
            issues.push(ComplianceIssue {
                severity: Severity::Medium,
                component: "overhead".to_string(),
                slice_type: None,
                description: format!(
                    "maximum combined overhead {:.1}% exceeds {}%",
                    summary.max_overhead_percent, OVERHEAD_CEILING_PERCENT
                ),
                impact: "A large share of link capacity is spent on encapsulation and shaping".to_string(),
                suggestion: "Simplify tc rules or raise the MTU on the overlay".to_string(),
            });
        }

        issues.sort_by_key(|i| i.severity);
        issues
    }
}

fn summarize(slices: &[SliceCompliance], overall_compliance: f64) -> ComplianceSummary {
    let runs: Vec<&RunResult> = slices.iter().flat_map(|s| s.runs.iter()).collect();
    let passed = runs.iter().filter(|r| r.success).count() as u32;
    let throughputs: Vec<f64> = runs
        .iter()
        .map(|r| r.throughput_mbps)
        .filter(|t| *t > 0.0)
        .collect();
    let latencies: Vec<f64> = runs.iter().map(|r| r.latency_ms).filter(|l| *l > 0.0).collect();
    let deploys: Vec<f64> = runs.iter().map(|r| r.deploy_time_ms as f64).collect();

    ComplianceSummary {
        total_tests: runs.len() as u32,
        passed_tests: passed,
        failed_tests: runs.len() as u32 - passed,
        overall_compliance,
        avg_deploy_time_ms: mean(&deploys),
        avg_throughput_mbps: mean(&throughputs),
        avg_latency_ms: mean(&latencies),
        max_overhead_percent: runs.iter().map(|r| r.overhead_percent).fold(0.0, f64::max),
    }
}

/// Unique suggestions in severity order.
fn recommendations(issues: &[ComplianceIssue]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for issue in issues {
        if !out.contains(&issue.suggestion) {
            out.push(issue.suggestion.clone());
        }
    }
    if out.is_empty() {
        out.push("All slices meet their reference targets".to_string());
    }
    out
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    let avg = mean(values);
    if values.len() < 2 || avg <= 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / avg * 100.0
}
