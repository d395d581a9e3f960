//! Reconciles results from several sources into one output.
//!
//! Every strategy ignores failed sources. With no successful source the
//! merge fails with [`MergeError::NoSuccess`] rather than producing an empty
//! payload.

use async_trait::async_trait;

use dispatch_common::{MergeStrategy, MergeSummary};

use super::endpoint::CallResult;

/// Preferred payload length band for best-quality scoring, in characters.
const TARGET_MIN_CHARS: usize = 80;
const TARGET_MAX_CHARS: usize = 4000;

const TRUNCATION_MARKERS: &[&str] = &["[truncated]", "...", "\u{2026}"];

/// One source's contribution.
#[derive(Debug, Clone)]
pub struct MergeInput {
    pub model: String,
    pub node_id: String,
    pub payload: Option<String>,
    pub confidence: Option<f32>,
    /// The source stopped on its token limit.
    pub truncated: bool,
    pub error: Option<String>,
}

impl MergeInput {
    pub fn success(model: &str, node_id: &str, payload: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            node_id: node_id.to_string(),
            payload: Some(payload.into()),
            confidence: None,
            truncated: false,
            error: None,
        }
    }

    pub fn failure(model: &str, node_id: &str, error: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            node_id: node_id.to_string(),
            payload: None,
            confidence: None,
            truncated: false,
            error: Some(error.into()),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// `model@node`, used to list contributing sources.
    pub fn label(&self) -> String {
        format!("{}@{}", self.model, self.node_id)
    }

    fn succeeded(&self) -> Option<&str> {
        self.payload.as_deref()
    }
}

impl From<CallResult> for MergeInput {
    fn from(result: CallResult) -> Self {
        let CallResult { endpoint, outcome } = result;
        match outcome {
            Ok(output) => Self {
                model: endpoint.model,
                node_id: endpoint.node_id,
                payload: Some(output.content),
                confidence: output.confidence,
                truncated: output.truncated,
                error: None,
            },
            Err(err) => Self::failure(&endpoint.model, &endpoint.node_id, err.to_string()),
        }
    }
}

/// Merged result.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    pub payload: String,
    /// Strategy that produced the payload.
    pub strategy: MergeStrategy,
    pub sources: Vec<String>,
    /// Ensemble synthesis failed and concatenation was used instead.
    pub fell_back: bool,
}

impl MergeOutput {
    pub fn summary(&self) -> MergeSummary {
        MergeSummary {
            strategy: self.strategy,
            sources: self.sources.clone(),
            fell_back: self.fell_back,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MergeError {
    #[error("no source succeeded ({})", .failures.join("; "))]
    NoSuccess { failures: Vec<String> },
}

/// Produces a single answer out of several for the ensemble strategy.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, combined: &str) -> Result<String, String>;
}

/// Merge `inputs` (in arrival order) with `strategy`.
pub async fn merge(
    inputs: &[MergeInput],
    strategy: MergeStrategy,
    synthesizer: Option<&dyn Synthesizer>,
) -> Result<MergeOutput, MergeError> {
    let successes: Vec<&MergeInput> = inputs.iter().filter(|i| i.succeeded().is_some()).collect();
    if successes.is_empty() {
        return Err(MergeError::NoSuccess {
            failures: inputs
                .iter()
                .map(|i| format!("{}: {}", i.label(), i.error.as_deref().unwrap_or("no output")))
                .collect(),
        });
    }

    let output = match strategy {
        MergeStrategy::Consensus => consensus(&successes),
        MergeStrategy::Weighted => weighted(&successes),
        MergeStrategy::Concatenate => concatenate(&successes),
        MergeStrategy::BestQuality => best_quality(&successes),
        MergeStrategy::Ensemble => ensemble(&successes, synthesizer).await,
    };
    tracing::debug!(
        strategy = %output.strategy,
        sources = output.sources.len(),
        fell_back = output.fell_back,
        "merged results"
    );
    Ok(output)
}

fn payload_of<'a>(input: &'a MergeInput) -> &'a str {
    input.payload.as_deref().unwrap_or_default()
}

fn single(input: &MergeInput, strategy: MergeStrategy) -> MergeOutput {
    MergeOutput {
        payload: payload_of(input).to_string(),
        strategy,
        sources: vec![input.label()],
        fell_back: false,
    }
}

/// Key under which two answers count as the same.
fn consensus_key(payload: &str) -> String {
    payload
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?' | ';' | ':' | ','))
        .to_string()
}

fn consensus(successes: &[&MergeInput]) -> MergeOutput {
    // Groups in first-seen order: (key, members).
    let mut groups: Vec<(String, Vec<&MergeInput>)> = Vec::new();
    for &input in successes {
        let key = consensus_key(payload_of(input));
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(input),
            None => groups.push((key, vec![input])),
        }
    }

    let mut winner = &groups[0].1;
    for (_, members) in &groups[1..] {
        if members.len() > winner.len() {
            winner = members;
        }
    }

    MergeOutput {
        payload: payload_of(winner[0]).to_string(),
        strategy: MergeStrategy::Consensus,
        sources: winner.iter().map(|i| i.label()).collect(),
        fell_back: false,
    }
}

fn weighted(successes: &[&MergeInput]) -> MergeOutput {
    let score = |i: &MergeInput| i.confidence.filter(|c| c.is_finite()).unwrap_or(0.0);
    let mut best = successes[0];
    for &input in &successes[1..] {
        if score(input) > score(best) {
            best = input;
        }
    }
    single(best, MergeStrategy::Weighted)
}

fn concatenate(successes: &[&MergeInput]) -> MergeOutput {
    let payload = successes
        .iter()
        .map(|i| format!("### {}\n{}", i.model, payload_of(i).trim()))
        .collect::<Vec<_>>()
        .join("\n\n");
    MergeOutput {
        payload,
        strategy: MergeStrategy::Concatenate,
        sources: successes.iter().map(|i| i.label()).collect(),
        fell_back: false,
    }
}

/// Heuristic quality of one answer. Higher is better.
fn quality_score(input: &MergeInput) -> f64 {
    let text = payload_of(input).trim();
    let len = text.chars().count();
    if len == 0 {
        return f64::MIN;
    }

    let mut score = if len < TARGET_MIN_CHARS {
        3.0 * len as f64 / TARGET_MIN_CHARS as f64
    } else if len > TARGET_MAX_CHARS {
        3.0 * TARGET_MAX_CHARS as f64 / len as f64
    } else {
        3.0
    };

    if text.ends_with(['.', '!', '?', '`', ')', '"']) {
        score += 1.0;
    }
    if text.matches("```").count() % 2 == 0 {
        score += 0.5;
    } else {
        score -= 1.0;
    }
    let balanced = [('(', ')'), ('[', ']'), ('{', '}')]
        .iter()
        .all(|(open, close)| text.matches(*open).count() == text.matches(*close).count());
    if balanced {
        score += 0.5;
    }
    if text.lines().filter(|l| !l.trim().is_empty()).count() > 1 {
        score += 0.5;
    }

    if input.truncated {
        score -= 3.0;
    }
    if TRUNCATION_MARKERS.iter().any(|m| text.ends_with(m)) {
        score -= 2.0;
    }
    score
}

fn best_quality(successes: &[&MergeInput]) -> MergeOutput {
    let mut best = successes[0];
    let mut best_score = quality_score(best);
    for &input in &successes[1..] {
        let score = quality_score(input);
        if score > best_score {
            best = input;
            best_score = score;
        }
    }
    single(best, MergeStrategy::BestQuality)
}

async fn ensemble(successes: &[&MergeInput], synthesizer: Option<&dyn Synthesizer>) -> MergeOutput {
    let mut fallback = concatenate(successes);
    let Some(synthesizer) = synthesizer else {
        tracing::warn!("no synthesis model configured, falling back to concatenation");
        fallback.fell_back = true;
        return fallback;
    };

    match synthesizer.synthesize(&fallback.payload).await {
        Ok(payload) => MergeOutput {
            payload,
            strategy: MergeStrategy::Ensemble,
            sources: fallback.sources,
            fell_back: false,
        },
        Err(e) => {
            tracing::warn!(error = %e, "synthesis failed, falling back to concatenation");
            fallback.fell_back = true;
            fallback
        }
    }
}
