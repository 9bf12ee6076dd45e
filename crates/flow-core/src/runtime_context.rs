// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime context for an agent session.
//!
//! This is separate from [`flow_config::AgentConfig`], which holds only
//! config-file fields.  [`AgentRuntimeContext`] carries values detected or
//! specified at runtime (project root, git/CI context, prompt overrides,
//! discovered skills).

use std::path::PathBuf;

/// Environment-detected context injected into an agent at construction time.
#[derive(Debug, Default, Clone)]
pub struct AgentRuntimeContext {
    /// Absolute path to the project root (found via `.git` walk-up).
    pub project_root: Option<PathBuf>,
    /// Pre-formatted git context block (branch, commit, dirty status).
    pub git_context_note: Option<String>,
    /// Pre-formatted CI environment context block.
    pub ci_context_note: Option<String>,
    /// Contents of the project context file (`.flow/context.md`, `AGENTS.md`, …).
    pub project_context_file: Option<String>,
    /// Text appended to the default system prompt.
    pub append_system_prompt: Option<String>,
    /// Full system prompt override.
    /// When set, replaces `AgentConfig::system_prompt` entirely.
    pub system_prompt_override: Option<String>,
}

impl AgentRuntimeContext {
    /// Detect project root, git state, and CI environment from the current
    /// working directory and process environment.
    pub fn auto_detect() -> Self {
        let project_root = flow_runtime::find_project_root().ok();
        let git_context_note = project_root
            .as_ref()
            .map(|r| flow_runtime::collect_git_context(r))
            .and_then(|g| g.to_prompt_section());
        let ci_context_note = flow_runtime::detect_ci_context().to_prompt_section();
        let project_context_file = project_root
            .as_ref()
            .and_then(|r| flow_runtime::load_project_context_file(r));

        Self {
            project_root,
            git_context_note,
            ci_context_note,
            project_context_file,
            append_system_prompt: None,
            system_prompt_override: None,
        }
    }
}
