//! Chat / agent routing
//!
//! Decides whether a message needs the code-executing agent or can be
//! answered directly by the chat model. Rules, in order:
//!
//! 1. message starts with an agent marker (`/agent`, `!`) → agent
//! 2. message contains an action keyword → agent
//! 3. otherwise → chat

use serde::Serialize;

use crate::config::RouterConfig;
use crate::metrics::ROUTE_DECISIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePath {
    Chat,
    Agent,
}

impl RoutePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutePath::Chat => "chat",
            RoutePath::Agent => "agent",
        }
    }
}

/// What caused the routing decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum RouteTrigger {
    Prefix(String),
    Keyword(String),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub path: RoutePath,
    pub trigger: RouteTrigger,
}

impl RouteDecision {
    /// The message with the matched agent marker removed
    pub fn strip_marker<'a>(&self, message: &'a str) -> &'a str {
        match &self.trigger {
            RouteTrigger::Prefix(marker) => message
                .trim_start()
                .strip_prefix(marker.as_str())
                .map(str::trim_start)
                .unwrap_or(message),
            _ => message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    markers: Vec<String>,
    /// Lowercased keywords
    keywords: Vec<String>,
}

impl Router {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            markers: config.agent_markers.clone(),
            keywords: config.keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn route(&self, message: &str) -> RouteDecision {
        let decision = self.decide(message);
        let trigger = match decision.trigger {
            RouteTrigger::Prefix(_) => "prefix",
            RouteTrigger::Keyword(_) => "keyword",
            RouteTrigger::None => "none",
        };
        ROUTE_DECISIONS
            .with_label_values(&[decision.path.as_str(), trigger])
            .inc();
        decision
    }

    fn decide(&self, message: &str) -> RouteDecision {
        let trimmed = message.trim_start();
        if let Some(marker) = self.markers.iter().find(|m| trimmed.starts_with(m.as_str())) {
            return RouteDecision {
                path: RoutePath::Agent,
                trigger: RouteTrigger::Prefix(marker.clone()),
            };
        }

        let lowered = message.to_lowercase();
        if let Some(keyword) = self.keywords.iter().find(|k| contains_keyword(&lowered, k)) {
            return RouteDecision {
                path: RoutePath::Agent,
                trigger: RouteTrigger::Keyword(keyword.clone()),
            };
        }

        RouteDecision {
            path: RoutePath::Chat,
            trigger: RouteTrigger::None,
        }
    }
}

/// ASCII keywords match whole words; others (e.g. CJK) match as substrings
fn contains_keyword(haystack: &str, keyword: &str) -> bool {
    if keyword.is_empty() {
        return false;
    }
    if !keyword.is_ascii() {
        return haystack.contains(keyword);
    }

    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(keyword).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + keyword.len()..].chars().next();
        !before.map_or(false, is_word) && !after.map_or(false, is_word)
    })
}
