//! Composite and catch-all rules.

use std::sync::Arc;

use super::{describe, Rule, RuleType};
use crate::metadata::Metadata;

fn join_payload(rules: &[Arc<dyn Rule>]) -> String {
    let parts: Vec<String> = rules
        .iter()
        .map(|rule| format!("({})", describe(rule.as_ref())))
        .collect();
    format!("({})", parts.join(","))
}

/// Matches when every child matches.
#[derive(Debug, Clone)]
pub struct And {
    rules: Vec<Arc<dyn Rule>>,
    payload: String,
    adapter: String,
}

impl And {
    pub fn new(rules: Vec<Arc<dyn Rule>>, adapter: &str) -> Self {
        Self {
            payload: join_payload(&rules),
            rules,
            adapter: adapter.to_string(),
        }
    }
}

impl Rule for And {
    fn rule_type(&self) -> RuleType {
        RuleType::And
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        !self.rules.is_empty() && self.rules.iter().all(|rule| rule.matches(metadata))
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }

    fn should_resolve_ip(&self) -> bool {
        self.rules.iter().any(|rule| rule.should_resolve_ip())
    }
}

/// Matches when any child matches.
#[derive(Debug, Clone)]
pub struct Or {
    rules: Vec<Arc<dyn Rule>>,
    payload: String,
    adapter: String,
}

impl Or {
    pub fn new(rules: Vec<Arc<dyn Rule>>, adapter: &str) -> Self {
        Self {
            payload: join_payload(&rules),
            rules,
            adapter: adapter.to_string(),
        }
    }
}

impl Rule for Or {
    fn rule_type(&self) -> RuleType {
        RuleType::Or
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        self.rules.iter().any(|rule| rule.matches(metadata))
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }

    fn should_resolve_ip(&self) -> bool {
        self.rules.iter().any(|rule| rule.should_resolve_ip())
    }
}

/// Inverts a single child.
#[derive(Debug, Clone)]
pub struct Not {
    rule: Arc<dyn Rule>,
    payload: String,
    adapter: String,
}

impl Not {
    pub fn new(rule: Arc<dyn Rule>, adapter: &str) -> Self {
        Self {
            payload: join_payload(std::slice::from_ref(&rule)),
            rule,
            adapter: adapter.to_string(),
        }
    }
}

impl Rule for Not {
    fn rule_type(&self) -> RuleType {
        RuleType::Not
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        !self.rule.matches(metadata)
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }

    fn should_resolve_ip(&self) -> bool {
        self.rule.should_resolve_ip()
    }
}

/// Final rule: matches everything.
#[derive(Debug, Clone)]
pub struct Match {
    adapter: String,
}

impl Match {
    pub fn new(adapter: &str) -> Self {
        Self {
            adapter: adapter.to_string(),
        }
    }
}

impl Rule for Match {
    fn rule_type(&self) -> RuleType {
        RuleType::Match
    }

    fn matches(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        ""
    }
}
