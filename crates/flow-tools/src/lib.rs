// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod elicitation;
pub mod events;
pub mod policy;
pub mod registry;
pub mod tool;
pub mod toolset;

pub use elicitation::{ElicitationHandler, ElicitationRequest, ElicitationResponse, OAuthHandler};
pub use events::{TodoItem, ToolEvent};
pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{OutputCategory, Tool, ToolCall, ToolOutput, ToolOutputPart};
pub use toolset::{StartableToolset, Toolset, ToolsetError};

pub use builtin::ask_question::{AskQuestionTool, Question, QuestionRequest};
pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::todo_write::TodoWriteTool;
