//! Model tier selection from task text.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// Backend tier a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Heavy,
}

/// Complexity to tier mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingTable {
    pub simple: Tier,
    pub moderate: Tier,
    pub complex: Tier,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            simple: Tier::Fast,
            moderate: Tier::Heavy,
            complex: Tier::Heavy,
        }
    }
}

impl RoutingTable {
    pub fn tier_for(&self, complexity: Complexity) -> Tier {
        match complexity {
            Complexity::Simple => self.simple,
            Complexity::Moderate => self.moderate,
            Complexity::Complex => self.complex,
        }
    }

    pub fn route(&self, task_text: &str) -> Tier {
        self.tier_for(classify(task_text))
    }
}

/// Action verb families; each family that matches counts once.
static ACTION_FAMILIES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\b(create|build|make|write|generate|design|scaffold)\b",
        r"\b(deploy|install|setup|set up|configure|provision|launch)\b",
        r"\b(search|find|look up|scan|analyze|compare|research)\b",
        r"\b(send|email|message|notify|remind|schedule)\b",
        r"\b(organize|clean|move|copy|delete|rename|compress|extract|backup)\b",
        r"\b(refactor|debug|test|run|execute|compile)\b",
        r"\b(download|upload|transfer|sync|import|export|migrate)\b",
        r"\b(update|upgrade|change|modify|edit|add|remove|fix|patch)\b",
    ]
    .iter()
    .map(|pattern| Regex::new(&format!("(?i){pattern}")).unwrap())
    .collect()
});

static SEQUENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)\b(and then|after that|afterwards|finally|step \d)\b|^\s*\d+[.)]\s").unwrap()
});

const LONG_TASK_CHARS: usize = 300;

/// Keyword and length heuristic.
///
/// Multi-step phrasing, long text, or three or more action families are
/// complex; one or two action families are moderate; anything else is simple.
pub fn classify(task_text: &str) -> Complexity {
    let families = ACTION_FAMILIES
        .iter()
        .filter(|re| re.is_match(task_text))
        .count();
    if SEQUENCE_RE.is_match(task_text)
        || task_text.chars().count() > LONG_TASK_CHARS
        || families >= 3
    {
        return Complexity::Complex;
    }
    if families >= 1 {
        return Complexity::Moderate;
    }
    Complexity::Simple
}
