//! Classifier/router: maps a request to a task type, model and priority.
//!
//! Each routing rule carries an ordered list of hints. A hint is either a
//! keyword (case-insensitive substring) or, when prefixed with `re:`, a
//! case-insensitive regular expression. A rule's score is the number of
//! (hint, text) matches over the request's free-text hints and its prompt.
//! The highest score wins; ties go to the rule listed first. A request that
//! matches nothing routes to the configured default.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};

use dispatch_common::{
    ClassifyResponse, ProcessRequest, RoutingInfo, RoutingRuleInfo, RoutingRulesResponse,
};

use crate::config::{RoutingConfig, RoutingRuleConfig};

const PATTERN_PREFIX: &str = "re:";

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Invalid hint pattern '{pattern}' for task type '{task_type}': {source}")]
    InvalidPattern {
        task_type: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Duplicate task type: {0}")]
    DuplicateTaskType(String),
    #[error("Routing rule '{0}' has no model")]
    MissingModel(String),
}

#[derive(Debug)]
enum HintMatcher {
    Keyword(String),
    Pattern(Regex),
}

impl HintMatcher {
    fn parse(task_type: &str, hint: &str) -> Result<Self, ClassifierError> {
        match hint.strip_prefix(PATTERN_PREFIX) {
            Some(pattern) => RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(Self::Pattern)
                .map_err(|source| ClassifierError::InvalidPattern {
                    task_type: task_type.to_string(),
                    pattern: pattern.to_string(),
                    source,
                }),
            None => Ok(Self::Keyword(hint.to_lowercase())),
        }
    }

    /// `lowered` is the lowercase form of `text`.
    fn matches(&self, text: &str, lowered: &str) -> bool {
        match self {
            Self::Keyword(keyword) => !keyword.is_empty() && lowered.contains(keyword.as_str()),
            Self::Pattern(regex) => regex.is_match(text),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    config: RoutingRuleConfig,
    matchers: Vec<HintMatcher>,
}

#[derive(Debug)]
struct RoutingTable {
    rules: Vec<CompiledRule>,
    default_task_type: String,
    default_model: String,
    default_priority: u8,
}

impl RoutingTable {
    fn compile(config: &RoutingConfig) -> Result<Self, ClassifierError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            if !seen.insert(rule.task_type.as_str()) {
                return Err(ClassifierError::DuplicateTaskType(rule.task_type.clone()));
            }
            if rule.model.trim().is_empty() {
                return Err(ClassifierError::MissingModel(rule.task_type.clone()));
            }
            let matchers = rule
                .hints
                .iter()
                .map(|hint| HintMatcher::parse(&rule.task_type, hint))
                .collect::<Result<Vec<_>, _>>()?;
            rules.push(CompiledRule {
                config: rule.clone(),
                matchers,
            });
        }
        Ok(Self {
            rules,
            default_task_type: config.default_task_type.clone(),
            default_model: config.default_model.clone(),
            default_priority: config.default_priority,
        })
    }
}

/// Outcome of routing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub task_type: String,
    pub model: String,
    pub priority: u8,
    pub score: u32,
    /// No rule matched; the default was used.
    pub fallback: bool,
    /// Configured hints of the winning rule that matched.
    pub matched_hints: Vec<String>,
}

impl RoutingDecision {
    pub fn to_info(&self) -> RoutingInfo {
        RoutingInfo {
            task_type: self.task_type.clone(),
            model: self.model.clone(),
            priority: self.priority,
            fallback: self.fallback,
        }
    }

    pub fn to_classify_response(&self) -> ClassifyResponse {
        ClassifyResponse {
            routing: self.to_info(),
            score: self.score,
            matched_hints: self.matched_hints.clone(),
        }
    }
}

/// Hint-scoring router over a hot-swappable rule table.
pub struct Classifier {
    table: RwLock<Arc<RoutingTable>>,
}

impl Classifier {
    pub fn new(config: &RoutingConfig) -> Result<Self, ClassifierError> {
        Ok(Self {
            table: RwLock::new(Arc::new(RoutingTable::compile(config)?)),
        })
    }

    /// Route a request. Pure with respect to the current rule table.
    pub fn route(&self, request: &ProcessRequest) -> RoutingDecision {
        // Requests in flight keep the table they started with.
        let table = self.table.read().clone();

        let mut texts: Vec<(&str, String)> = request
            .task_hints
            .iter()
            .map(|h| (h.as_str(), h.to_lowercase()))
            .collect();
        texts.push((request.prompt.as_str(), request.prompt.to_lowercase()));

        let mut best: Option<(&CompiledRule, u32, Vec<String>)> = None;
        let mut tied = false;
        for rule in &table.rules {
            let mut score = 0u32;
            let mut matched = Vec::new();
            for (matcher, hint) in rule.matchers.iter().zip(&rule.config.hints) {
                let hits = texts
                    .iter()
                    .filter(|(text, lowered)| matcher.matches(text, lowered))
                    .count() as u32;
                if hits > 0 {
                    score += hits;
                    matched.push(hint.clone());
                }
            }
            let best_score = best.as_ref().map_or(0, |(_, s, _)| *s);
            if score > best_score {
                tied = false;
                best = Some((rule, score, matched));
            } else if score > 0 && score == best_score {
                tied = true;
            }
        }

        let priority_for = |rule_priority: u8| request.priority.unwrap_or(rule_priority);

        match best {
            Some((rule, score, matched_hints)) => {
                if tied {
                    tracing::debug!(
                        task_type = %rule.config.task_type,
                        score,
                        "ambiguous classification, earliest rule wins"
                    );
                }
                RoutingDecision {
                    task_type: rule.config.task_type.clone(),
                    model: rule.config.model.clone(),
                    priority: priority_for(rule.config.priority),
                    score,
                    fallback: false,
                    matched_hints,
                }
            }
            None => RoutingDecision {
                task_type: table.default_task_type.clone(),
                model: table.default_model.clone(),
                priority: priority_for(table.default_priority),
                score: 0,
                fallback: true,
                matched_hints: Vec::new(),
            },
        }
    }

    /// Current task type to model table.
    pub fn rules(&self) -> RoutingRulesResponse {
        let table = self.table.read().clone();
        RoutingRulesResponse {
            rules: table
                .rules
                .iter()
                .map(|r| RoutingRuleInfo {
                    task_type: r.config.task_type.clone(),
                    model: r.config.model.clone(),
                    hints: r.config.hints.clone(),
                    priority: r.config.priority,
                })
                .collect(),
            default_task_type: table.default_task_type.clone(),
            default_model: table.default_model.clone(),
            default_priority: table.default_priority,
        }
    }

    /// Replace the rule table. The old table stays in place if the new one
    /// does not compile.
    pub fn reload(&self, config: &RoutingConfig) -> Result<(), ClassifierError> {
        let table = RoutingTable::compile(config)?;
        let count = table.rules.len();
        *self.table.write() = Arc::new(table);
        tracing::info!("Routing table reloaded with {} rules", count);
        Ok(())
    }
}
