// SPDX-License-Identifier: MIT OR Apache-2.0
//! Classifies free text for deontic directives (MUST/NEVER/SHOULD/MAY) and
//! resolves conflicts between directives of differing authority.
//!
//! The classifier never guesses: anything not matching a directive pattern
//! is [`DeonticClass::Informational`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The kind of normative force a piece of text carries, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeonticClass {
    /// `MUST …` — a hard requirement.
    Must,
    /// `NEVER …` — a hard prohibition.
    Never,
    /// `SHOULD …` — a strong recommendation.
    Should,
    /// `MAY …` — a permission.
    May,
    /// No directive pattern matched.
    Informational,
}

/// Source of a directive, ordered by precedence: `Root(1) > User(2) >
/// Memory(3)` — the lowest number wins a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeonticAuthority {
    /// Root-level configuration or system prompt. Precedence 1.
    Root,
    /// Explicit user instruction. Precedence 2.
    User,
    /// A directive recovered from stored memory (the default authority for
    /// anything not explicitly attributed to `user` or `root`). Precedence 3.
    Memory,
}

impl Default for DeonticAuthority {
    fn default() -> Self {
        Self::Memory
    }
}

impl DeonticAuthority {
    /// Numeric precedence: lower wins.
    #[must_use]
    pub fn precedence(self) -> u8 {
        match self {
            Self::Root => 1,
            Self::User => 2,
            Self::Memory => 3,
        }
    }
}

static NEVER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bnever\b").unwrap());
static MUST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bmust\b").unwrap());
static SHOULD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bshould\b").unwrap());
static MAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bmay\b").unwrap());

/// Scan `text` for a deontic directive pattern. `NEVER` and `MUST` (hard
/// constraints) are checked before `SHOULD`/`MAY` so a sentence carrying
/// both a hard and soft directive classifies as the stronger one.
#[must_use]
pub fn classify(text: &str) -> DeonticClass {
    if NEVER_RE.is_match(text) {
        DeonticClass::Never
    } else if MUST_RE.is_match(text) {
        DeonticClass::Must
    } else if SHOULD_RE.is_match(text) {
        DeonticClass::Should
    } else if MAY_RE.is_match(text) {
        DeonticClass::May
    } else {
        DeonticClass::Informational
    }
}

/// A single directive with its source authority, as extracted from some
/// piece of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeonticDirective {
    /// The text the directive was found in.
    pub text: String,
    /// The classified directive strength.
    pub class: DeonticClass,
    /// Which authority the directive came from.
    pub authority: DeonticAuthority,
}

impl DeonticDirective {
    /// Classify `text` and attribute it to `authority`.
    #[must_use]
    pub fn new(text: impl Into<String>, authority: DeonticAuthority) -> Self {
        let text = text.into();
        let class = classify(&text);
        Self {
            text,
            class,
            authority,
        }
    }
}

/// Outcome of resolving a set of potentially conflicting directives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeonticResolution {
    /// The directive that wins, by precedence.
    pub winner: DeonticDirective,
    /// Note explaining the resolution, present whenever more than one
    /// directive was in play.
    pub note: Option<String>,
}

const ROOT_WINS_NOTE: &str = "If memory conflicts with root directives, the root wins.";

/// Resolve conflicting directives by precedence: `root > user > memory`.
///
/// Returns `None` if `directives` is empty — there is nothing to resolve.
#[must_use]
pub fn resolve_conflicts(directives: &[DeonticDirective]) -> Option<DeonticResolution> {
    let winner = directives.iter().min_by_key(|d| d.authority.precedence())?.clone();
    let note = if directives.len() > 1 {
        Some(ROOT_WINS_NOTE.to_string())
    } else {
        None
    };
    Some(DeonticResolution { winner, note })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_never_as_strongest() {
        assert_eq!(classify("You should do X but never do Y"), DeonticClass::Never);
    }

    #[test]
    fn classifies_must() {
        assert_eq!(classify("You must run tests before committing"), DeonticClass::Must);
    }

    #[test]
    fn classifies_should() {
        assert_eq!(classify("You should prefer composition"), DeonticClass::Should);
    }

    #[test]
    fn classifies_may() {
        assert_eq!(classify("You may skip this step"), DeonticClass::May);
    }

    #[test]
    fn unmatched_text_is_informational() {
        assert_eq!(classify("The build succeeded in 4 seconds"), DeonticClass::Informational);
    }

    #[test]
    fn never_does_not_false_positive_on_substrings() {
        // "whenever" contains "never" as a substring but not as a word.
        assert_eq!(classify("whenever convenient, refactor"), DeonticClass::Informational);
    }

    #[test]
    fn root_wins_over_memory() {
        let directives = vec![
            DeonticDirective::new("never commit secrets", DeonticAuthority::Memory),
            DeonticDirective::new("must use feature flags", DeonticAuthority::Root),
        ];
        let resolution = resolve_conflicts(&directives).unwrap();
        assert_eq!(resolution.winner.authority, DeonticAuthority::Root);
        assert_eq!(resolution.note.as_deref(), Some(ROOT_WINS_NOTE));
    }

    #[test]
    fn user_wins_over_memory() {
        let directives = vec![
            DeonticDirective::new("should avoid globals", DeonticAuthority::Memory),
            DeonticDirective::new("must avoid globals", DeonticAuthority::User),
        ];
        let resolution = resolve_conflicts(&directives).unwrap();
        assert_eq!(resolution.winner.authority, DeonticAuthority::User);
    }

    #[test]
    fn single_directive_has_no_note() {
        let directives = vec![DeonticDirective::new("must test", DeonticAuthority::Memory)];
        let resolution = resolve_conflicts(&directives).unwrap();
        assert!(resolution.note.is_none());
    }

    #[test]
    fn empty_directives_resolve_to_none() {
        assert!(resolve_conflicts(&[]).is_none());
    }

    #[test]
    fn memory_is_default_authority() {
        assert_eq!(DeonticAuthority::default(), DeonticAuthority::Memory);
    }

    #[test]
    fn precedence_ordering_matches_spec() {
        assert!(DeonticAuthority::Root.precedence() < DeonticAuthority::User.precedence());
        assert!(DeonticAuthority::User.precedence() < DeonticAuthority::Memory.precedence());
    }
}
