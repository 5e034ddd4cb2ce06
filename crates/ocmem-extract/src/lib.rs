// SPDX-License-Identifier: MIT OR Apache-2.0
//! Strategy-chained extraction: turns a raw tool invocation into a
//! structured observation, and a finished session into a six-field summary.
//!
//! Three extraction strategies are tried in order: a host-session bridge
//! (the embedding agent's own already-running model, supplied by the host),
//! a direct call to a configured model API, and a pure fallback that
//! synthesizes a minimal observation without any LLM at all. The fallback
//! never fails, so [`ExtractorClient::extract`] always returns something as
//! long as at least the fallback strategy is in the chain.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use ocmem_config::{is_allowed_extractor_host, MemoryConfig};
use ocmem_core::{ObservationType, SessionSummary, MIN_NARRATIVE_LEN};
use ocmem_error::{ErrorCode, OcError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum characters of captured tool output forwarded to a strategy.
/// Longer output is truncated before it ever reaches an LLM call.
pub const MAX_OUTPUT_CHARS: usize = 4000;

/// Maximum title length, per the wire contract.
pub const MAX_TITLE_CHARS: usize = 80;

/// Per-request timeout for network-backed strategies.
const STRATEGY_TIMEOUT: Duration = Duration::from_secs(15);

/// Structured result of one extraction attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedObservation {
    /// Headline, at most [`MAX_TITLE_CHARS`] characters.
    pub title: String,
    /// Subject classification. Never [`ObservationType::Summary`] — that
    /// variant is reserved for rendered session summaries, not extractions.
    #[serde(rename = "type")]
    pub ty: ObservationType,
    /// Prose description, at least [`MIN_NARRATIVE_LEN`] characters.
    pub narrative: String,
    /// Extracted concepts/keywords.
    #[serde(default)]
    pub concepts: Vec<String>,
    /// Extracted facts.
    #[serde(default)]
    pub facts: Vec<String>,
}

/// Check `obs` against the wire contract. Returns the first violation found.
///
/// # Errors
///
/// Returns [`ErrorCode::SchemaInvalid`] if the type is `Summary`, or
/// [`ErrorCode::NarrativeTooShort`] if the narrative is too short, or
/// [`ErrorCode::SchemaInvalid`] if the title is empty or too long.
pub fn validate(obs: &ExtractedObservation) -> Result<(), OcError> {
    let title_len = obs.title.trim().chars().count();
    if title_len == 0 || title_len > MAX_TITLE_CHARS {
        return Err(OcError::new(ErrorCode::SchemaInvalid, "title must be 1-80 characters")
            .with_context("title_len", title_len));
    }
    if obs.ty == ObservationType::Summary {
        return Err(OcError::new(
            ErrorCode::SchemaInvalid,
            "extraction must not produce a Summary-typed observation",
        ));
    }
    let narrative_len = obs.narrative.trim().chars().count();
    if narrative_len < MIN_NARRATIVE_LEN {
        return Err(OcError::new(ErrorCode::NarrativeTooShort, "narrative below minimum length")
            .with_context("narrative_len", narrative_len));
    }
    Ok(())
}

/// Scrub `args` and cap `output` at [`MAX_OUTPUT_CHARS`], the two
/// pre-flight transforms every strategy must see applied before it ever
/// touches an LLM.
#[must_use]
pub fn sanitize_inputs(args: &str, output: &str) -> (String, String) {
    let scrubbed_args = ocmem_scrub::scrub_str(args);
    let truncated_output: String = if output.chars().count() <= MAX_OUTPUT_CHARS {
        output.to_string()
    } else {
        output.chars().take(MAX_OUTPUT_CHARS).collect()
    };
    (scrubbed_args, truncated_output)
}

/// One step in the extraction strategy chain.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    /// Short name for logging and diagnostics.
    fn name(&self) -> &'static str;

    /// Whether this strategy calls an LLM. LLM-backed strategies get exactly
    /// one repair retry on validation failure; the pure fallback does not
    /// (it never fails validation in the first place).
    fn is_llm_backed(&self) -> bool {
        true
    }

    /// Attempt extraction. `args` and `output` have already been sanitized
    /// via [`sanitize_inputs`].
    async fn extract(&self, tool: &str, args: &str, output: &str) -> Result<ExtractedObservation, OcError>;
}

/// Bridge into the embedding host's own already-running model session.
/// Implemented by the host, not by this crate — the host-session strategy
/// is a thin adapter over whatever this returns.
#[async_trait]
pub trait HostSessionBridge: Send + Sync {
    /// Ask the host's current session to extract from `(tool, args, output)`.
    /// Returns `None` if the host has no session available right now (the
    /// chain falls through to the next strategy, it does not error).
    async fn extract(&self, tool: &str, args: &str, output: &str) -> Option<ExtractedObservation>;
}

struct HostSessionStrategy {
    bridge: Arc<dyn HostSessionBridge>,
}

#[async_trait]
impl ExtractionStrategy for HostSessionStrategy {
    fn name(&self) -> &'static str {
        "host-session"
    }

    async fn extract(&self, tool: &str, args: &str, output: &str) -> Result<ExtractedObservation, OcError> {
        self.bridge
            .extract(tool, args, output)
            .await
            .ok_or_else(|| OcError::new(ErrorCode::WorkerUnreachable, "host session unavailable"))
    }
}

/// Strategy that POSTs to a configured model dispatcher.
///
/// Constructed only when both `extractor_api_key` and
/// `extractor_dispatcher_url` are set and the dispatcher host passes the
/// SSRF allow-list; see [`DirectApiStrategy::from_config`].
pub struct DirectApiStrategy {
    client: reqwest::Client,
    dispatcher_url: String,
    api_key: String,
}

/// Minimal strict-JSON request/response envelope for the dispatcher's
/// extraction endpoint.
#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    tool: &'a str,
    args: &'a str,
    output: &'a str,
}

impl DirectApiStrategy {
    /// Build a strategy from `config`, or `None` if the extractor is not
    /// configured or its dispatcher host fails the SSRF allow-list.
    #[must_use]
    pub fn from_config(config: &MemoryConfig) -> Option<Self> {
        let url = config.extractor_dispatcher_url.clone()?;
        let api_key = config.extractor_api_key.clone()?;
        let host = url_host(&url)?;
        if !is_allowed_extractor_host(&host) {
            warn!(host, "extractor dispatcher host is not on the allow-list, skipping direct API strategy");
            return None;
        }
        let client = reqwest::Client::builder().timeout(STRATEGY_TIMEOUT).build().ok()?;
        Some(Self { client, dispatcher_url: url, api_key })
    }
}

#[async_trait]
impl ExtractionStrategy for DirectApiStrategy {
    fn name(&self) -> &'static str {
        "direct-api"
    }

    async fn extract(&self, tool: &str, args: &str, output: &str) -> Result<ExtractedObservation, OcError> {
        let endpoint = format!("{}/extract", self.dispatcher_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&ExtractRequest { tool, args, output })
            .send()
            .await
            .map_err(|e| OcError::new(ErrorCode::RequestTimeout, "extractor dispatcher request failed").with_source(e))?;

        if !resp.status().is_success() {
            return Err(OcError::new(ErrorCode::HttpError, "extractor dispatcher returned a non-2xx status")
                .with_context("status", resp.status().as_u16()));
        }

        resp.json::<ExtractedObservation>()
            .await
            .map_err(|e| OcError::new(ErrorCode::SchemaInvalid, "extractor dispatcher response failed schema").with_source(e))
    }
}

/// Extracts a minimal observation from `tool` and `args` alone, with no LLM
/// call. Always the last link in the chain: it never fails validation, so
/// [`ExtractorClient::extract`] always produces a result as long as this
/// strategy is present.
pub struct PureFallbackStrategy;

#[async_trait]
impl ExtractionStrategy for PureFallbackStrategy {
    fn name(&self) -> &'static str {
        "pure-fallback"
    }

    fn is_llm_backed(&self) -> bool {
        false
    }

    async fn extract(&self, tool: &str, args: &str, _output: &str) -> Result<ExtractedObservation, OcError> {
        let args_summary = summarize_args(args);
        let title = truncate_chars(&format!("{tool}: {args_summary}"), MAX_TITLE_CHARS);
        let narrative = pad_narrative(format!("Ran {tool} with {args_summary}."));
        Ok(ExtractedObservation {
            title,
            ty: classify_heuristically(tool, args),
            narrative,
            concepts: Vec::new(),
            facts: Vec::new(),
        })
    }
}

fn summarize_args(args: &str) -> String {
    let trimmed = args.trim();
    if trimmed.is_empty() {
        "no arguments".to_string()
    } else {
        truncate_chars(trimmed, 60)
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn pad_narrative(s: String) -> String {
    if s.trim().chars().count() >= MIN_NARRATIVE_LEN {
        s
    } else {
        format!("{s} (no further detail captured)")
    }
}

/// Keyword heuristic used only by [`PureFallbackStrategy`] when no LLM is
/// available to classify the observation.
fn classify_heuristically(tool: &str, args: &str) -> ObservationType {
    let haystack = format!("{tool} {args}").to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| haystack.contains(n));

    if has(&["fix", "bug", "error", "crash"]) {
        ObservationType::Bugfix
    } else if has(&["refactor", "rename", "cleanup", "simplify"]) {
        ObservationType::Refactor
    } else if has(&["add", "new feature", "implement"]) {
        ObservationType::Feature
    } else if has(&["decide", "decision", "choose", "chosen"]) {
        ObservationType::Decision
    } else if has(&["discover", "found", "investigat", "turns out"]) {
        ObservationType::Discovery
    } else {
        ObservationType::Change
    }
}

fn url_host(raw: &str) -> Option<String> {
    let after_scheme = raw.split_once("://").map_or(raw, |(_, rest)| rest);
    let host_port = after_scheme.split(['/', '?', '#']).next()?;
    let host = host_port.rsplit_once('@').map_or(host_port, |(_, h)| h);
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Runs the extraction strategy chain and applies the single repair retry
/// rule for LLM-backed strategies.
pub struct ExtractorClient {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl ExtractorClient {
    /// Build an empty chain. Strategies are tried in the order appended.
    #[must_use]
    pub fn new() -> Self {
        Self { strategies: Vec::new() }
    }

    /// Append a strategy to the end of the chain.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn ExtractionStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Assemble the standard chain from configuration: host-session (if a
    /// bridge is supplied), direct model API (if configured and allowed),
    /// then the pure fallback, which is always present.
    #[must_use]
    pub fn from_config(config: &MemoryConfig, host_bridge: Option<Arc<dyn HostSessionBridge>>) -> Self {
        let mut client = Self::new();
        if let Some(bridge) = host_bridge {
            client = client.with_strategy(Box::new(HostSessionStrategy { bridge }));
        }
        if let Some(direct) = DirectApiStrategy::from_config(config) {
            client = client.with_strategy(Box::new(direct));
        }
        client.with_strategy(Box::new(PureFallbackStrategy))
    }

    /// Extract a structured observation from `(tool, args, output)`.
    ///
    /// Sanitizes `args`/`output`, then tries each strategy in order. An
    /// LLM-backed strategy whose result fails validation gets exactly one
    /// repair retry before the chain moves to the next strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::Internal`] only if every strategy in the chain
    /// failed or produced an invalid result (impossible if
    /// [`PureFallbackStrategy`] is in the chain).
    pub async fn extract(&self, tool: &str, args: &str, output: &str) -> Result<ExtractedObservation, OcError> {
        let (args, output) = sanitize_inputs(args, output);
        for strategy in &self.strategies {
            if let Some(obs) = try_strategy(strategy.as_ref(), tool, &args, &output).await {
                return Ok(obs);
            }
        }
        Err(OcError::new(ErrorCode::Internal, "all extraction strategies exhausted").with_context("tool", tool))
    }
}

impl Default for ExtractorClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn try_strategy(
    strategy: &dyn ExtractionStrategy,
    tool: &str,
    args: &str,
    output: &str,
) -> Option<ExtractedObservation> {
    match strategy.extract(tool, args, output).await {
        Ok(obs) if validate(&obs).is_ok() => Some(obs),
        Ok(_invalid) if strategy.is_llm_backed() => {
            debug!(strategy = strategy.name(), "extraction failed validation, issuing repair retry");
            match strategy.extract(tool, args, output).await {
                Ok(obs) if validate(&obs).is_ok() => Some(obs),
                _ => {
                    warn!(strategy = strategy.name(), "repair retry also failed validation");
                    None
                }
            }
        }
        Ok(_invalid) => None,
        Err(e) => {
            debug!(strategy = strategy.name(), error = %e, "extraction strategy failed");
            None
        }
    }
}

/// Summarizes a finished session into the six-field summary contract.
/// Implemented by whatever backs session summarization (host session or
/// direct model API); `None` on any failure, never synthesized content.
#[async_trait]
pub trait SessionSummarizer: Send + Sync {
    /// Summarize `observations` recorded over `duration_minutes` for
    /// `session_id`. Returns `None` if the summarizer could not produce a
    /// trustworthy summary; callers must not invent one in its place.
    async fn summarize(
        &self,
        session_id: &str,
        duration_minutes: u64,
        observations: &[ocmem_core::Observation],
    ) -> Option<SessionSummary>;
}

#[derive(Debug, Serialize)]
struct SummarizeRequest<'a> {
    session_id: &'a str,
    duration_minutes: u64,
    observations: &'a [ocmem_core::Observation],
}

/// Session summarizer backed by the same configured model dispatcher as
/// [`DirectApiStrategy`].
pub struct DirectApiSummarizer {
    client: reqwest::Client,
    dispatcher_url: String,
    api_key: String,
}

impl DirectApiSummarizer {
    /// Build a summarizer from `config`, or `None` under the same
    /// conditions as [`DirectApiStrategy::from_config`].
    #[must_use]
    pub fn from_config(config: &MemoryConfig) -> Option<Self> {
        let url = config.extractor_dispatcher_url.clone()?;
        let api_key = config.extractor_api_key.clone()?;
        let host = url_host(&url)?;
        if !is_allowed_extractor_host(&host) {
            return None;
        }
        let client = reqwest::Client::builder().timeout(STRATEGY_TIMEOUT).build().ok()?;
        Some(Self { client, dispatcher_url: url, api_key })
    }
}

#[async_trait]
impl SessionSummarizer for DirectApiSummarizer {
    async fn summarize(
        &self,
        session_id: &str,
        duration_minutes: u64,
        observations: &[ocmem_core::Observation],
    ) -> Option<SessionSummary> {
        let endpoint = format!("{}/summarize", self.dispatcher_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&SummarizeRequest { session_id, duration_minutes, observations })
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<SessionSummary>().await.ok()
    }
}
