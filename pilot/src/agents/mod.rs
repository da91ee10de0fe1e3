//! Sub-agents: scoped think/act loops the planner delegates to.

pub mod deploy;
pub mod runner;

pub use deploy::Deployments;
pub use runner::{Deployment, ForceStopReason, SubAgentReport, SubAgentRunner};

use crate::core::types::AgentKind;
use crate::tools::{ToolCategory, ToolId};

/// Tool subset and behaviour of one agent kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProfile {
    pub kind: AgentKind,
    pub role: &'static str,
    /// Shown to the planner next to the deploy tool.
    pub summary: &'static str,
    pub tools: Vec<ToolId>,
    /// Whether the calls of one step may run concurrently.
    pub parallel_safe: bool,
}

impl AgentProfile {
    pub fn for_kind(kind: AgentKind) -> Self {
        use ToolId::{
            Click, FetchUrl, Goto, ListFiles, Look, ReadFile, RunCommand, Scroll, Think, TypeText,
            WriteFile,
        };
        match kind {
            AgentKind::Research => Self {
                kind,
                role: "You gather facts from the web and local files and report them with sources.",
                summary: "Research questions on the web or in local documents. Read-only.",
                tools: vec![FetchUrl, ReadFile, ListFiles, Think],
                parallel_safe: true,
            },
            AgentKind::File => Self {
                kind,
                role: "You inspect, create and edit files.",
                summary: "Find, read, write and reorganise files.",
                tools: vec![ListFiles, ReadFile, WriteFile, Think],
                parallel_safe: false,
            },
            AgentKind::System => Self {
                kind,
                role: "You run shell commands to inspect and change the local system.",
                summary: "Run commands, build and test code, inspect processes.",
                tools: vec![RunCommand, ReadFile, ListFiles, WriteFile, Think],
                parallel_safe: false,
            },
            AgentKind::Browser => Self {
                kind,
                role: "You drive a web browser: navigate, read pages, click and type.",
                summary: "Interact with websites through a real browser.",
                tools: vec![Goto, Look, Click, TypeText, Scroll, Think],
                parallel_safe: false,
            },
        }
    }

    pub fn has_tool(&self, name: &str) -> bool {
        name.parse::<ToolId>()
            .is_ok_and(|id| self.tools.contains(&id))
    }

    pub fn is_observe(&self, name: &str) -> bool {
        name.parse::<ToolId>()
            .is_ok_and(|id| id.category() == ToolCategory::Observe)
    }

    /// Tool names in one category, in profile order.
    pub fn tools_in(&self, category: ToolCategory) -> Vec<&'static str> {
        self.tools
            .iter()
            .filter(|id| id.category() == category && **id != ToolId::Think)
            .map(|id| id.as_str())
            .collect()
    }

    /// Profiles that both observe and act get the observation-streak guard.
    pub fn mixes_observe_and_act(&self) -> bool {
        !self.tools_in(ToolCategory::Observe).is_empty() && !self.tools_in(ToolCategory::Act).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_cover_every_kind() {
        for kind in AgentKind::ALL {
            let profile = AgentProfile::for_kind(kind);
            assert_eq!(profile.kind, kind);
            assert!(!profile.tools.is_empty());
        }
    }

    #[test]
    fn research_is_read_only_and_parallel() {
        let profile = AgentProfile::for_kind(AgentKind::Research);
        assert!(profile.parallel_safe);
        assert!(!profile.mixes_observe_and_act());
        assert!(!profile.has_tool("write_file"));
    }

    #[test]
    fn system_profile_mixes_categories() {
        let profile = AgentProfile::for_kind(AgentKind::System);
        assert!(profile.mixes_observe_and_act());
        assert_eq!(profile.tools_in(ToolCategory::Act), vec!["run_command", "write_file"]);
        assert!(profile.is_observe("read_file"));
        assert!(!profile.is_observe("done"));
    }
}
