// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::{Observation, Session};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/import`. Sessions are imported before observations so
/// that foreign-key-shaped lookups (session existence) succeed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ImportRequest {
    /// Sessions to upsert, processed first.
    #[serde(default)]
    pub sessions: Vec<Session>,
    /// Observations to ingest, processed second.
    #[serde(default)]
    pub observations: Vec<Observation>,
}

/// Normalized `{code, message, details?}` envelope for `/api/import` error
/// responses. The worker's exact envelope varies across minor versions;
/// callers normalize anything else to `ErrorCode::ApiError`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorEnvelope {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Response from a successful `/api/import` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ImportResponse {
    /// Number of sessions accepted.
    #[serde(default)]
    pub sessions_accepted: u32,
    /// Number of observations accepted.
    #[serde(default)]
    pub observations_accepted: u32,
}

/// One block of rendered content, matching the worker's `content: [...]`
/// envelope shape used by `/api/context/recent`, `/api/search`, and
/// `/api/search/observations`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain rendered text.
    Text {
        /// The rendered text.
        text: String,
    },
}

/// The common response envelope for the read endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContentEnvelope {
    /// One or more content blocks.
    pub content: Vec<ContentBlock>,
}

impl ContentEnvelope {
    /// Wrap a single rendered text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_envelope_text_wraps_a_single_block() {
        let env = ContentEnvelope::text("hello");
        assert_eq!(env.content.len(), 1);
        match &env.content[0] {
            ContentBlock::Text { text } => assert_eq!(text, "hello"),
        }
    }

    #[test]
    fn error_envelope_omits_absent_details() {
        let e = ErrorEnvelope {
            code: "HTTP_ERROR".into(),
            message: "boom".into(),
            details: None,
        };
        let s = serde_json::to_string(&e).unwrap();
        assert!(!s.contains("details"));
    }
}
