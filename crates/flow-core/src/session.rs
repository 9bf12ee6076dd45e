// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;

use flow_model::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tool call awaiting human approval before dispatch.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
}

/// An elicitation question awaiting a human answer.
#[derive(Debug, Clone)]
pub struct PendingElicitation {
    pub request_id: String,
    pub prompt: String,
    pub options: Vec<String>,
}

/// In-memory conversation session: the transcript, its token accounting, and
/// the run-state needed to pause/resume a turn across approval and
/// elicitation boundaries.
///
/// A `Session` belongs to exactly one root agent (and, transitively, every
/// sub-agent it hands off to); the session manager is responsible for
/// serializing access from concurrent callers (see the session manager
/// component) — `Session` itself does no locking.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    /// If this session was forked from another (a sub-agent invoked via
    /// `transfer_task` with its own session), the parent's id.
    pub parent_session_id: Option<String>,
    pub messages: Vec<Message>,

    /// Approximate input tokens in `messages`, corrected by
    /// `calibration_factor`. Recomputed on every `push`/`replace_messages`.
    pub token_count: usize,
    /// Total context window advertised by the active model (input + output).
    pub max_tokens: usize,
    /// Max tokens the model may produce in a single turn; subtracted from
    /// `max_tokens` when computing how much room remains for input.
    pub max_output_tokens: usize,
    /// Fixed token overhead for the request envelope (tool schemas, system
    /// prompt boilerplate) that is not represented by any single message.
    pub schema_overhead: usize,

    /// Running correction applied to the 4-chars-per-token heuristic,
    /// derived from comparing estimated vs. provider-reported usage on each
    /// turn. Starts at `1.0` and is nudged towards `actual / estimated` by
    /// an exponential moving average so a single noisy turn cannot swing it.
    pub calibration_factor: f32,
    pub cache_read_total: u64,
    pub cache_write_total: u64,
    /// Cumulative provider-reported input/output tokens across every turn
    /// this session has run. Monotonically non-decreasing.
    pub input_tokens_total: u64,
    pub output_tokens_total: u64,
    /// Cumulative estimated spend in USD, derived from the active model's
    /// catalog per-token rates at the time each turn's usage was folded in.
    /// `0.0` for models with no catalog pricing entry. Monotonically
    /// non-decreasing.
    pub cost_total: f64,

    /// Tool names the user has approved for the remainder of this session
    /// ("approve for this session" — distinct from a one-shot approval).
    pub approved_tools: HashSet<String>,
    /// When true, every `Ask`-policy tool call is auto-approved without
    /// prompting (the "YOLO" run mode).
    pub auto_approve: bool,

    pub pending_approval: Option<PendingApproval>,
    pub pending_elicitation: Option<PendingElicitation>,
}

/// Durable snapshot of a [`Session`], as persisted by the session manager
/// between process restarts. Pending approval/elicitation state is
/// intentionally not persisted: a resumed session always resumes at a clean
/// turn boundary (see the session manager's `ResumeSession` operation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub parent_session_id: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: usize,
    pub max_output_tokens: usize,
    pub schema_overhead: usize,
    pub calibration_factor: f32,
    pub cache_read_total: u64,
    pub cache_write_total: u64,
    #[serde(default)]
    pub input_tokens_total: u64,
    #[serde(default)]
    pub output_tokens_total: u64,
    #[serde(default)]
    pub cost_total: f64,
    pub approved_tools: Vec<String>,
}

impl Session {
    pub fn new(max_tokens: usize, max_output_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_session_id: None,
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
            input_tokens_total: 0,
            output_tokens_total: 0,
            cost_total: 0.0,
            approved_tools: HashSet::new(),
            auto_approve: false,
            pending_approval: None,
            pending_elicitation: None,
        }
    }

    pub fn restore(snapshot: SessionSnapshot) -> Self {
        let mut s = Self {
            id: snapshot.id,
            parent_session_id: snapshot.parent_session_id,
            messages: Vec::new(),
            token_count: 0,
            max_tokens: snapshot.max_tokens,
            max_output_tokens: snapshot.max_output_tokens,
            schema_overhead: snapshot.schema_overhead,
            calibration_factor: snapshot.calibration_factor,
            cache_read_total: snapshot.cache_read_total,
            cache_write_total: snapshot.cache_write_total,
            input_tokens_total: snapshot.input_tokens_total,
            output_tokens_total: snapshot.output_tokens_total,
            cost_total: snapshot.cost_total,
            approved_tools: snapshot.approved_tools.into_iter().collect(),
            auto_approve: false,
            pending_approval: None,
            pending_elicitation: None,
        };
        s.replace_messages(snapshot.messages);
        s
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            parent_session_id: self.parent_session_id.clone(),
            messages: self.messages.clone(),
            max_tokens: self.max_tokens,
            max_output_tokens: self.max_output_tokens,
            schema_overhead: self.schema_overhead,
            calibration_factor: self.calibration_factor,
            cache_read_total: self.cache_read_total,
            cache_write_total: self.cache_write_total,
            input_tokens_total: self.input_tokens_total,
            output_tokens_total: self.output_tokens_total,
            cost_total: self.cost_total,
            approved_tools: self.approved_tools.iter().cloned().collect(),
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += self.calibrated_tokens(&msg);
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    fn calibrated_tokens(&self, msg: &Message) -> usize {
        ((msg.approx_tokens() as f32) * self.calibration_factor).round() as usize
    }

    /// Tokens available for input on the next turn: the context window minus
    /// the reserved output budget and the fixed schema overhead.
    pub fn input_budget(&self) -> usize {
        self.max_tokens
            .saturating_sub(self.max_output_tokens)
            .saturating_sub(self.schema_overhead)
    }

    /// Fraction of the input budget consumed (0.0-1.0+; can exceed 1.0 once
    /// over budget, callers should clamp for display).
    pub fn context_fraction(&self) -> f32 {
        let budget = self.input_budget();
        if budget == 0 {
            return 0.0;
        }
        (self.token_count as f32) / (budget as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction or a
    /// calibration update).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| self.calibrated_tokens(m)).sum();
    }

    /// Replace the message list and recalculate token count (compaction,
    /// resubmit/edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Fold a turn's provider-reported usage into the running counters and
    /// nudge `calibration_factor` towards `actual / estimated` via an
    /// exponential moving average (alpha = 0.2), so no single turn can swing
    /// the estimate drastically.
    ///
    /// `input_cost_per_million`/`output_cost_per_million` are the active
    /// model's catalog rates in USD per 1M tokens (`None` for an unpriced
    /// model, folded in as zero cost for this turn).
    pub fn add_cache_usage(
        &mut self,
        usage: flow_model::Usage,
        input_cost_per_million: Option<f64>,
        output_cost_per_million: Option<f64>,
    ) {
        self.cache_read_total += usage.cache_read_tokens as u64;
        self.cache_write_total += usage.cache_write_tokens as u64;
        self.input_tokens_total += usage.input_tokens as u64;
        self.output_tokens_total += usage.output_tokens as u64;
        self.cost_total += (usage.input_tokens as f64 / 1_000_000.0)
            * input_cost_per_million.unwrap_or(0.0)
            + (usage.output_tokens as f64 / 1_000_000.0) * output_cost_per_million.unwrap_or(0.0);

        let estimated: usize = self.messages.iter().map(|m| m.approx_tokens()).sum();
        if estimated > 0 && usage.input_tokens > 0 {
            let ratio = (usage.input_tokens as f32) / (estimated as f32);
            const ALPHA: f32 = 0.2;
            self.calibration_factor = self.calibration_factor * (1.0 - ALPHA) + ratio * ALPHA;
            self.recalculate_tokens();
        }
    }

    pub fn approve_tool_for_session(&mut self, tool_name: impl Into<String>) {
        self.approved_tools.insert(tool_name.into());
    }

    pub fn is_tool_approved(&self, tool_name: &str) -> bool {
        self.auto_approve || self.approved_tools.contains(tool_name)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session(max_tokens: usize) -> Session {
        Session::new(max_tokens, 0)
    }

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn new_session_has_unique_id() {
        let a = session(1000);
        let b = session(1000);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn new_session_starts_empty() {
        let s = session(1000);
        assert!(s.messages.is_empty());
        assert_eq!(s.token_count, 0);
        assert_eq!(s.calibration_factor, 1.0);
    }

    // ── Token accounting ──────────────────────────────────────────────────────

    #[test]
    fn push_increments_token_count() {
        let mut s = session(1000);
        s.push(Message::user("12345678")); // 8 chars -> 2 tokens
        assert_eq!(s.token_count, 2);
    }

    #[test]
    fn push_many_accumulates_tokens() {
        let mut s = session(10_000);
        s.push_many([Message::user("12345678"), Message::assistant("abcd")]);
        assert_eq!(s.token_count, 3);
    }

    #[test]
    fn recalculate_tokens_matches_push_sum() {
        let mut s = session(1000);
        s.push(Message::user("hello world"));
        let after_push = s.token_count;
        s.recalculate_tokens();
        assert_eq!(s.token_count, after_push);
    }

    #[test]
    fn replace_messages_sets_messages_and_recalculates_tokens() {
        let mut s = session(1000);
        s.push(Message::user("first"));
        s.push(Message::assistant("reply"));
        assert_eq!(s.messages.len(), 2);
        let new_msgs = vec![Message::user("only")];
        s.replace_messages(new_msgs.clone());
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.messages[0].as_text(), Some("only"));
        assert_eq!(s.token_count, 1);
    }

    // ── Input budget ──────────────────────────────────────────────────────────

    #[test]
    fn input_budget_subtracts_output_and_overhead() {
        let mut s = Session::new(1000, 200);
        s.schema_overhead = 50;
        assert_eq!(s.input_budget(), 750);
    }

    #[test]
    fn input_budget_saturates_at_zero() {
        let s = Session::new(100, 200);
        assert_eq!(s.input_budget(), 0);
    }

    // ── Context fraction ──────────────────────────────────────────────────────

    #[test]
    fn context_fraction_zero_when_empty() {
        let s = session(1000);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_zero_budget_does_not_panic() {
        let s = Session::new(0, 0);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_increases_with_messages() {
        let mut s = session(100);
        let before = s.context_fraction();
        s.push(Message::user("a long message that uses more tokens"));
        assert!(s.context_fraction() > before);
    }

    // ── Near-limit detection ──────────────────────────────────────────────────

    #[test]
    fn is_near_limit_false_when_empty() {
        let s = session(1000);
        assert!(!s.is_near_limit(0.8));
    }

    #[test]
    fn is_near_limit_true_when_over_threshold() {
        let mut s = session(4);
        s.push(Message::user("1234567890123"));
        s.push(Message::user("abcd"));
        assert!(s.is_near_limit(0.8));
    }

    // ── Calibration ──────────────────────────────────────────────────────────

    #[test]
    fn add_cache_usage_nudges_calibration_towards_actual_ratio() {
        let mut s = session(10_000);
        s.push(Message::user("12345678")); // estimated 2 tokens
        let usage = flow_model::Usage {
            input_tokens: 4, // actual is double the estimate
            output_tokens: 1,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        };
        s.add_cache_usage(usage, None, None);
        assert!(s.calibration_factor > 1.0);
    }

    #[test]
    fn add_cache_usage_accumulates_cache_totals() {
        let mut s = session(1000);
        s.add_cache_usage(
            flow_model::Usage {
                input_tokens: 0,
                output_tokens: 0,
                cache_read_tokens: 10,
                cache_write_tokens: 5,
            },
            None,
            None,
        );
        s.add_cache_usage(
            flow_model::Usage {
                input_tokens: 0,
                output_tokens: 0,
                cache_read_tokens: 3,
                cache_write_tokens: 0,
            },
            None,
            None,
        );
        assert_eq!(s.cache_read_total, 13);
        assert_eq!(s.cache_write_total, 5);
    }

    #[test]
    fn add_cache_usage_accumulates_token_and_cost_totals() {
        let mut s = session(1000);
        s.add_cache_usage(
            flow_model::Usage {
                input_tokens: 1000,
                output_tokens: 500,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            },
            Some(2.5),
            Some(10.0),
        );
        assert_eq!(s.input_tokens_total, 1000);
        assert_eq!(s.output_tokens_total, 500);
        assert!((s.cost_total - 0.0075).abs() < 1e-9);
        s.add_cache_usage(
            flow_model::Usage {
                input_tokens: 1000,
                output_tokens: 500,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            },
            Some(2.5),
            Some(10.0),
        );
        assert_eq!(s.input_tokens_total, 2000);
        assert!((s.cost_total - 0.015).abs() < 1e-9);
    }

    // ── Approval state ────────────────────────────────────────────────────────

    #[test]
    fn tool_is_not_approved_by_default() {
        let s = session(1000);
        assert!(!s.is_tool_approved("read_file"));
    }

    #[test]
    fn approve_tool_for_session_persists_for_session_lifetime() {
        let mut s = session(1000);
        s.approve_tool_for_session("read_file");
        assert!(s.is_tool_approved("read_file"));
        assert!(!s.is_tool_approved("write_file"));
    }

    #[test]
    fn auto_approve_approves_every_tool() {
        let mut s = session(1000);
        s.auto_approve = true;
        assert!(s.is_tool_approved("anything"));
    }

    // ── Snapshot round-trip ────────────────────────────────────────────────────

    #[test]
    fn snapshot_restore_round_trip_preserves_transcript_and_counters() {
        let mut s = Session::new(1000, 100);
        s.push(Message::user("hello"));
        s.approve_tool_for_session("read_file");
        s.add_cache_usage(
            flow_model::Usage {
                input_tokens: 2,
                output_tokens: 1,
                cache_read_tokens: 1,
                cache_write_tokens: 0,
            },
            Some(1.0),
            Some(1.0),
        );
        let snap = s.snapshot();
        let restored = Session::restore(snap);
        assert_eq!(restored.id, s.id);
        assert_eq!(restored.messages.len(), 1);
        assert_eq!(restored.cache_read_total, 1);
        assert_eq!(restored.input_tokens_total, 2);
        assert_eq!(restored.output_tokens_total, 1);
        assert!(restored.cost_total > 0.0);
        assert!(restored.is_tool_approved("read_file"));
        // pending state is never persisted
        assert!(restored.pending_approval.is_none());
    }

    #[test]
    fn restore_resets_pending_state_and_auto_approve() {
        let mut s = Session::new(1000, 100);
        s.auto_approve = true;
        s.pending_elicitation = Some(PendingElicitation {
            request_id: "q1".into(),
            prompt: "pick one".into(),
            options: vec!["a".into(), "b".into()],
        });
        let restored = Session::restore(s.snapshot());
        assert!(!restored.auto_approve);
        assert!(restored.pending_elicitation.is_none());
    }
}
