//! System prompt rendering for the planner and sub-agents.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::tools::ToolSpec;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const SUBAGENT_TEMPLATE: &str = include_str!("prompts/subagent.md");

#[derive(Debug, Clone, Serialize)]
struct ToolLine<'a> {
    name: &'a str,
    description: &'a str,
}

fn tool_lines(specs: &[ToolSpec]) -> Vec<ToolLine<'_>> {
    specs
        .iter()
        .map(|spec| ToolLine {
            name: &spec.name,
            description: &spec.description,
        })
        .collect()
}

/// Deployable agent as listed in the planner prompt.
#[derive(Debug, Clone, Serialize)]
pub struct AgentLine {
    pub tool: String,
    pub description: String,
}

pub struct PlannerPrompt<'a> {
    pub tools: &'a [ToolSpec],
    pub agents: Vec<AgentLine>,
    pub max_deployments: u32,
}

pub struct SubAgentPrompt<'a> {
    pub kind: &'a str,
    pub role: &'a str,
    pub tools: &'a [ToolSpec],
    pub observe_tools: Vec<&'a str>,
    pub act_tools: Vec<&'a str>,
    pub soft_budget: u32,
    pub hard_budget: u32,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .context("load planner template")?;
        env.add_template("subagent", SUBAGENT_TEMPLATE)
            .context("load subagent template")?;
        Ok(Self { env })
    }

    pub fn planner(&self, input: &PlannerPrompt<'_>) -> Result<String> {
        let rendered = self.env.get_template("planner")?.render(context! {
            tools => tool_lines(input.tools),
            agents => &input.agents,
            max_deployments => input.max_deployments,
        })?;
        Ok(rendered)
    }

    pub fn subagent(&self, input: &SubAgentPrompt<'_>) -> Result<String> {
        let rendered = self.env.get_template("subagent")?.render(context! {
            kind => input.kind,
            role => input.role,
            tools => tool_lines(input.tools),
            observe_tools => &input.observe_tools,
            act_tools => &input.act_tools,
            soft_budget => input.soft_budget,
            hard_budget => input.hard_budget,
        })?;
        Ok(rendered)
    }
}
