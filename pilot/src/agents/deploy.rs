//! Per-task deployment accounting and failure escalation.

use crate::agents::runner::SubAgentReport;
use crate::core::types::{AgentKind, DeploymentStatus, ToolResult, truncate_chars};

const SUMMARY_CHARS: usize = 200;

/// Escalating advice after each failed deployment in a task.
const RECOVERY_LADDER: [&str; 4] = [
    "Deploy the same agent again with more specific instructions that target the failure.",
    "Try a completely different approach with the same agent.",
    "Deploy a different kind of agent, or do the step yourself with your own tools.",
    "Stop deploying agents. Ask the user for help with send_message, or call give_up and explain what was tried.",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub kind: AgentKind,
    pub task: String,
    pub status: DeploymentStatus,
    pub success: bool,
    pub summary: String,
}

/// Deployments made for the current task.
#[derive(Debug, Clone)]
pub struct Deployments {
    max: u32,
    records: Vec<DeploymentRecord>,
}

impl Deployments {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            records: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.records.clear();
    }

    pub fn count(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn can_deploy(&self) -> bool {
        self.count() < self.max
    }

    pub fn records(&self) -> &[DeploymentRecord] {
        &self.records
    }

    fn failures(&self) -> impl Iterator<Item = &DeploymentRecord> {
        self.records.iter().filter(|record| !record.success)
    }

    fn failure_lines(&self) -> String {
        self.failures()
            .map(|record| {
                format!(
                    "- {} agent ({}): {}",
                    record.kind,
                    truncate_chars(&record.task, 80),
                    record.summary
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Result for a deploy call beyond the per-task limit.
    pub fn limit_result(&self) -> ToolResult {
        let mut content = format!(
            "Deployment limit reached: {} agents already deployed for this task. \
             Finish with what you have, ask the user, or call give_up.",
            self.count()
        );
        let failures = self.failure_lines();
        if !failures.is_empty() {
            content.push_str("\nPrevious failures:\n");
            content.push_str(&failures);
        }
        ToolResult::failure(content)
    }

    /// Record a finished deployment and build the planner-facing result.
    ///
    /// Failed deployments get the next rung of the recovery ladder and the
    /// list of earlier failures appended.
    pub fn record(&mut self, report: &SubAgentReport) -> ToolResult {
        let result = report.to_tool_result();
        let earlier = self.failure_lines();
        self.records.push(DeploymentRecord {
            kind: report.deployment.agent_kind,
            task: report.deployment.task_text.clone(),
            status: report.status(),
            success: result.success,
            summary: truncate_chars(&report.summary, SUMMARY_CHARS).to_string(),
        });
        if result.success {
            return result;
        }

        let failures = self.failures().count();
        let rung = RECOVERY_LADDER[(failures - 1).min(RECOVERY_LADDER.len() - 1)];
        let mut content = format!(
            "{}\n\nRecovery (failure {failures} this task): {rung}",
            result.content
        );
        if !earlier.is_empty() {
            content.push_str("\nEarlier failures:\n");
            content.push_str(&earlier);
        }
        ToolResult::failure(content)
    }
}
