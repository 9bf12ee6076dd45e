use serde::{Deserialize, Serialize};

// ─── Transcript message ───────────────────────────────────────────────────────

/// A single entry in a session transcript.
///
/// This is the wire-compatible shape described by the core's external
/// interface: the same structure is appended to a [`Session`][crate::Message]
/// transcript and sent (after trimming to the active history window) to a
/// [`ModelProvider`](crate::ModelProvider) as part of a [`CompletionRequest`].
/// Once appended to a transcript a `Message` is never mutated — edits are
/// modelled as new messages, not in-place updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// Plain text content. Empty for an assistant message that produced only
    /// tool calls.
    #[serde(default)]
    pub content: String,
    /// Hidden chain-of-thought-style text, when the model exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Set when `role == Tool`: the id of the tool call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set when `role == Assistant` and the model requested one or more tool
    /// invocations in this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    pub created_at: i64,
    /// Name of the agent that authored this message, for multi-agent
    /// transcripts where several agents share one session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

/// A tool invocation requested by the model, as carried on an assistant
/// message's `tool_calls` list.
///
/// `arguments` holds the JSON-encoded argument object accumulated by
/// concatenating streamed deltas; it is parsed into a `serde_json::Value`
/// only once dispatch begins (see `flow_tools::ToolCall`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: FunctionCall { name: name.into(), arguments: arguments.into() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Message {
    /// `created_at` is left at `0`; callers that append to a live session
    /// should set it from a clock injected at the call site (the core itself
    /// never reads the wall clock — see the session manager).
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        let mut m = Self::new(Role::Assistant, text);
        m.tool_calls = tool_calls;
        m
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::new(Role::Tool, content);
        m.tool_call_id = Some(id.into());
        m
    }

    fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            reasoning_content: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
            created_at: 0,
            agent_name: None,
        }
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_agent_name(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning_content = Some(reasoning.into());
        self
    }

    /// Return the plain text of this message, or `None` for a tool-call-only
    /// assistant message with no accompanying text.
    pub fn as_text(&self) -> Option<&str> {
        if self.content.is_empty() && !self.tool_calls.is_empty() {
            None
        } else {
            Some(&self.content)
        }
    }

    /// Approximate token count used for context management.
    ///
    /// Uses a 4-chars-per-token heuristic; [`crate::fallback`] callers that
    /// need a calibrated estimate should scale this by the session's running
    /// `calibration_factor` instead of reading it raw.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.content.len();
        if let Some(r) = &self.reasoning_content {
            chars += r.len();
        }
        for tc in &self.tool_calls {
            chars += tc.function.name.len() + tc.function.arguments.len();
        }
        (chars / 4).max(1)
    }
}

/// Behavioral hints a provider or host may use to decide how a tool call is
/// surfaced (e.g. skipping an approval prompt for a declared-read-only tool).
/// Advisory only: nothing in this crate enforces them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolAnnotations {
    /// Human-friendly display name, distinct from the wire `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub destructive: bool,
    /// Calling it twice with the same arguments has the same effect as once.
    #[serde(default)]
    pub idempotent: bool,
    /// Operates against a domain outside the host's control (e.g. the web)
    /// rather than a closed, enumerable set of resources.
    #[serde(default)]
    pub open_world: bool,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    /// Dynamic context (e.g. git branch/commit, CI info) that should NOT be
    /// included in the cached portion of the system prompt. Providers that
    /// support prompt caching append this after the cached prefix; providers
    /// that don't simply concatenate it onto the system message text.
    pub system_dynamic_suffix: Option<String>,
    /// Opaque cache partition key. Two requests with the same `cache_key`
    /// are eligible to share a provider-side prompt cache entry; `None`
    /// disables cache bookkeeping for this request.
    pub cache_key: Option<String>,
    /// Advertises whether the caller will dispatch tool calls from one
    /// assistant message concurrently. Read-only tools are only ever batched
    /// in parallel by the driver when this is `true` (see the tool dispatch
    /// & approval component).
    pub parallel_tool_calls: bool,
}

/// A single streamed event from the model.
///
/// Each variant belongs to exactly one logical channel (text, reasoning,
/// tool-call-delta, usage, finish); providers may interleave channels in any
/// order and the driver must tolerate it.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// The model hit its configured output-token limit before finishing;
    /// carries no payload, the driver decides how to react (retry with a
    /// larger budget, surface a warning, …).
    MaxTokens,
    /// A text delta streamed from the model.
    TextDelta(String),
    /// A thinking/reasoning delta (extended-thinking-style APIs).
    ThinkingDelta(String),
    /// A fragment of a tool call. `index` identifies the logical tool-call
    /// slot within the turn (providers may interleave fragments for several
    /// slots); `id`/`name` are present on the first fragment of a slot and
    /// absent (empty string) on continuation fragments. `arguments` carries
    /// this fragment's slice of the JSON-encoded argument object.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Usage deltas reported mid-stream or at the end.
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        /// Tokens served from the provider's prompt cache (read hit).
        cache_read_tokens: u32,
        /// Tokens written into the provider's prompt cache (write/creation).
        cache_write_tokens: u32,
    },
    /// Terminal chunk. After this (or `Error`), the stream yields no more
    /// items.
    Done,
    /// A recoverable-looking error observed mid-stream; the fallback wrapper
    /// decides whether it is actually retryable (see `crate::fallback`).
    Error(String),
}

/// Token usage from one turn, as folded into session counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn message_assistant_sets_role_and_text() {
        let m = Message::assistant("reply");
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.as_text(), Some("reply"));
    }

    #[test]
    fn message_tool_result_sets_role_and_tool_call_id() {
        let m = Message::tool_result("call-1", "output");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(m.as_text(), Some("output"));
    }

    #[test]
    fn assistant_with_tool_calls_and_no_text_has_no_text() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest::new("c1", "read_file", "{}")],
        );
        assert!(m.as_text().is_none());
        assert_eq!(m.tool_calls.len(), 1);
    }

    #[test]
    fn assistant_can_carry_both_text_and_tool_calls() {
        let m = Message::assistant_with_tool_calls(
            "let me check that",
            vec![ToolCallRequest::new("c1", "read_file", "{}")],
        );
        assert_eq!(m.as_text(), Some("let me check that"));
        assert_eq!(m.tool_calls.len(), 1);
    }

    #[test]
    fn approx_tokens_text_divides_by_four() {
        let m = Message::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        let m = Message::user("hi");
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_empty_text_is_one() {
        let m = Message::user("");
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_counts_tool_call_name_and_arguments() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest::new("id", "aaaa", "bbbbbbbb")], // 4 + 8 = 12 chars
        );
        assert_eq!(m.approx_tokens(), 3);
    }

    #[test]
    fn approx_tokens_includes_reasoning_content() {
        let m = Message::assistant("ok").with_reasoning("12345678"); // 2 + 8 = 10 chars -> 2 tokens
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::user("test payload").with_created_at(42);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.role, Role::User);
        assert_eq!(decoded.as_text(), Some("test payload"));
        assert_eq!(decoded.created_at, 42);
    }

    #[test]
    fn tool_calls_are_omitted_from_json_when_empty() {
        let m = Message::user("hi");
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("tool_calls"));
    }

    #[test]
    fn tool_schema_serialises_correctly() {
        let ts = ToolSchema {
            name: "my_tool".into(),
            description: "desc".into(),
            parameters: serde_json::json!({ "type": "object" }),
            output_schema: None,
            annotations: None,
        };
        let json = serde_json::to_string(&ts).unwrap();
        assert!(json.contains("my_tool"));
        assert!(json.contains("desc"));
    }
}
