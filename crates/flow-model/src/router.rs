// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic content-based routing.
//!
//! A model configured with `routing` rules is a router: it carries child
//! model references and, given the current user message, picks the child
//! whose examples most closely match. The core guarantees only: picks are
//! deterministic given identical inputs, routing falls through to a default
//! child on no match, and the selected child is then subject to its own
//! fallback chain (see [`crate::fallback`]).
//!
//! Matching here is a small deterministic scorer (token-overlap against each
//! child's example phrases) rather than an embedding/LLM classifier — the
//! core only promises determinism and a documented fallthrough, not a
//! specific matching algorithm; a real deployment may swap this for an
//! embedding-backed implementation behind the same [`Router::route`] API.
use std::collections::HashSet;

/// One routable child: a name plus example phrases that route to it.
#[derive(Debug, Clone)]
pub struct RouteChild {
    pub name: String,
    pub examples: Vec<String>,
}

/// A deterministic content-based router over a set of named children.
#[derive(Debug, Clone)]
pub struct Router {
    children: Vec<RouteChild>,
    default_child: String,
}

impl Router {
    /// `children` is consulted in declared order; `default_child` must name
    /// an entry in `children` (or any value — `route` falls through to it
    /// literally when nothing matches, even if it is not itself routable).
    pub fn new(children: Vec<RouteChild>, default_child: impl Into<String>) -> Self {
        Self { children, default_child: default_child.into() }
    }

    /// Select a child name for `message`. Deterministic: identical input
    /// always yields the identical output. Ties are broken by earliest
    /// declaration order. Falls through to `default_child` when no child's
    /// examples overlap with the message at all.
    pub fn route(&self, message: &str) -> &str {
        let tokens = tokenize(message);
        let mut best: Option<(usize, &str)> = None;

        for child in &self.children {
            let score = child
                .examples
                .iter()
                .map(|ex| overlap_score(&tokens, &tokenize(ex)))
                .max()
                .unwrap_or(0);
            if score == 0 {
                continue;
            }
            match best {
                Some((best_score, _)) if score <= best_score => {}
                _ => best = Some((score, &child.name)),
            }
        }

        best.map(|(_, name)| name).unwrap_or(&self.default_child)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase().split_whitespace().map(|s| s.trim_matches(|c: char| !c.is_alphanumeric()).to_string()).filter(|s| !s.is_empty()).collect()
}

fn overlap_score(a: &HashSet<String>, b: &HashSet<String>) -> usize {
    a.intersection(b).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_router() -> Router {
        Router::new(
            vec![
                RouteChild { name: "coder".into(), examples: vec!["fix this bug".into(), "write a function".into()] },
                RouteChild { name: "researcher".into(), examples: vec!["find papers about".into(), "summarize this article".into()] },
            ],
            "general",
        )
    }

    #[test]
    fn routes_to_best_matching_child() {
        let r = sample_router();
        assert_eq!(r.route("please fix this bug in the parser"), "coder");
    }

    #[test]
    fn routes_to_other_child_on_different_content() {
        let r = sample_router();
        assert_eq!(r.route("can you summarize this article for me"), "researcher");
    }

    #[test]
    fn falls_through_to_default_on_no_match() {
        let r = sample_router();
        assert_eq!(r.route("what time is it in Tokyo"), "general");
    }

    #[test]
    fn deterministic_for_identical_input() {
        let r = sample_router();
        let a = r.route("write a function to sort a list");
        let b = r.route("write a function to sort a list");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_children_always_falls_through() {
        let r = Router::new(vec![], "fallback-child");
        assert_eq!(r.route("anything at all"), "fallback-child");
    }

    #[test]
    fn tie_breaks_to_earliest_declared_child() {
        let r = Router::new(
            vec![
                RouteChild { name: "first".into(), examples: vec!["shared word".into()] },
                RouteChild { name: "second".into(), examples: vec!["shared word".into()] },
            ],
            "default",
        );
        assert_eq!(r.route("shared word appears here"), "first");
    }
}
