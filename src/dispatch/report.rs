use serde::Serialize;

use super::job::{JobDescriptor, JobOutcome};

/// Supported output formats for run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Markdown summary.
    Markdown,
    /// JSON summary with all jobs inline.
    Json,
}

/// Per-job report entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    /// Job id.
    pub id: String,
    /// Mutant artifact.
    pub assembly_path: String,
    /// Outcome classification.
    pub outcome: JobOutcome,
    /// Baseline duration in milliseconds.
    pub total_ms_benchmark: Option<u64>,
    /// Number of selected tests; zero means the whole suite.
    pub tests_selected: usize,
}

impl From<&JobDescriptor> for JobReport {
    fn from(job: &JobDescriptor) -> Self {
        Self {
            id: job.id.clone(),
            assembly_path: job.assembly_path.display().to_string(),
            outcome: job.outcome(),
            total_ms_benchmark: job.total_ms_benchmark,
            tests_selected: job.tests_to_run.len(),
        }
    }
}

fn outcome_label(outcome: JobOutcome) -> &'static str {
    match outcome {
        JobOutcome::Skipped => "skipped",
        JobOutcome::Passed => "survived",
        JobOutcome::Failed => "killed",
        JobOutcome::TimedOut => "timeout",
    }
}

/// Aggregated result counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Total results.
    pub total: usize,
    /// Mutation score (killed or timed out / executed), percentage.
    pub mutation_score: f64,
    /// Suites that passed: the mutant survived.
    pub passed: usize,
    /// Suites that failed: the mutant was killed.
    pub failed: usize,
    /// Runs killed at their deadline.
    pub timed_out: usize,
    /// Jobs returned without being executed.
    pub skipped: usize,
}

impl RunSummary {
    /// Build a summary from collected results.
    pub fn from_results(results: &[JobDescriptor]) -> Self {
        let mut out = Self {
            total: results.len(),
            mutation_score: 0.0,
            passed: 0,
            failed: 0,
            timed_out: 0,
            skipped: 0,
        };

        for job in results {
            match job.outcome() {
                JobOutcome::Passed => out.passed += 1,
                JobOutcome::Failed => out.failed += 1,
                JobOutcome::TimedOut => out.timed_out += 1,
                JobOutcome::Skipped => out.skipped += 1,
            }
        }

        let executed = out.total.saturating_sub(out.skipped);
        if executed > 0 {
            out.mutation_score = ((out.failed + out.timed_out) as f64) * 100.0 / (executed as f64);
        } else {
            out.mutation_score = 100.0;
        }

        out
    }
}

/// Render a summary of `results` in the requested format.
pub fn render_summary(results: &[JobDescriptor], format: ReportFormat) -> String {
    let summary = RunSummary::from_results(results);
    let jobs: Vec<JobReport> = results.iter().map(JobReport::from).collect();

    match format {
        ReportFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
            "summary": summary,
            "jobs": jobs,
        }))
        .expect("summary JSON should serialize"),
        ReportFormat::Markdown => {
            let mut out = String::from("# Dispatch Run\n\n");

            out.push_str("## Summary\n\n| metric | count |\n|---|---:|\n");
            out.push_str(&format!("| total | {} |\n", summary.total));
            out.push_str(&format!("| killed | {} |\n", summary.failed));
            out.push_str(&format!("| survived | {} |\n", summary.passed));
            out.push_str(&format!("| timeout | {} |\n", summary.timed_out));
            out.push_str(&format!("| skipped | {} |\n", summary.skipped));
            out.push_str(&format!(
                "| mutation score | {:.2}% |\n",
                summary.mutation_score
            ));

            if !jobs.is_empty() {
                out.push_str("\n## Jobs\n\n| id | artifact | status | baseline |\n|---|---|---|---:|\n");
                for job in &jobs {
                    let baseline = job
                        .total_ms_benchmark
                        .map(|ms| format!("{ms}ms"))
                        .unwrap_or_else(|| "-".to_string());
                    out.push_str(&format!(
                        "| {} | {} | {} | {} |\n",
                        job.id,
                        job.assembly_path,
                        outcome_label(job.outcome),
                        baseline
                    ));
                }
            }

            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, tests_pass: Option<bool>, exited_in_time: Option<bool>) -> JobDescriptor {
        let mut job = JobDescriptor::new(format!("/mutants/{id}"), Vec::new()).with_id(id);
        job.tests_pass = tests_pass;
        job.exited_in_time = exited_in_time;
        job
    }

    #[test]
    fn summary_counts_all_outcomes() {
        let results = [
            result("a", Some(false), Some(true)),
            result("b", Some(true), Some(true)),
            result("c", Some(false), Some(false)),
            result("d", None, None),
        ];
        let summary = RunSummary::from_results(&results);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.skipped, 1);
        assert!((summary.mutation_score - (2.0 / 3.0 * 100.0)).abs() < 1e-12);
    }

    #[test]
    fn summary_handles_nothing_executed() {
        let summary = RunSummary::from_results(&[result("a", None, None)]);
        assert_eq!(summary.mutation_score, 100.0);
    }

    #[test]
    fn renders_json_and_markdown() {
        let results = [
            result("a", Some(false), Some(true)).with_benchmark_ms(120),
            result("b", None, None),
        ];
        let md = render_summary(&results, ReportFormat::Markdown);
        assert!(md.contains("# Dispatch Run"));
        assert!(md.contains("| killed | 1 |"));
        assert!(md.contains("| a | /mutants/a | killed | 120ms |"));
        assert!(md.contains("| b | /mutants/b | skipped | - |"));

        let json = render_summary(&results, ReportFormat::Json);
        assert!(json.contains("\"skipped\": 1"));
        assert!(json.contains("\"outcome\": \"failed\""));
        assert!(json.contains("\"jobs\":"));
    }
}
