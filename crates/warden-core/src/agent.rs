//! Agent records, limits, and usage accounting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleMachine;
use crate::types::{AgentId, NodeId, Timestamp, TokenId, TrustLevel};

/// Resource limits applied to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    /// Worker heap cap in megabytes.
    pub memory_mb: u64,
    /// Ceiling for a single task, milliseconds.
    pub task_timeout_ms: u64,
    /// Consecutive task failures before the agent enters `error`.
    pub max_errors: u32,
    /// Worker restarts before giving up.
    pub max_restarts: u32,
    /// LLM requests admitted per minute.
    pub requests_per_minute: u32,
    /// LLM tokens admitted per minute.
    pub tokens_per_minute: u32,
    /// Hard spend ceiling in USD, if any.
    pub max_cost_usd: Option<f64>,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            task_timeout_ms: 120_000,
            max_errors: 5,
            max_restarts: 3,
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            max_cost_usd: None,
        }
    }
}

/// Cumulative token usage for an agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens consumed.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Add another usage sample.
    pub fn add(&mut self, input: u64, output: u64) {
        self.input_tokens = self.input_tokens.saturating_add(input);
        self.output_tokens = self.output_tokens.saturating_add(output);
    }

    /// Total tokens in both directions.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// A sliding usage window for rate accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageWindow {
    /// Start of the current window.
    pub window_start: Option<Timestamp>,
    /// Requests observed in the window.
    pub requests: u32,
    /// Tokens observed in the window.
    pub tokens: u64,
}

/// A task currently dispatched to the agent's worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    /// Correlation id of the in-flight task.
    pub task_id: String,
    /// Absolute deadline for the task.
    pub deadline: Timestamp,
}

/// The full record for one managed agent.
///
/// The entry holds the sandbox *id* (the agent's own id doubles as the
/// registry key); it never holds the sandbox itself. The registry owns
/// sandboxes, the entry owns bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    /// Stable internal identifier.
    pub id: AgentId,
    /// Caller-supplied identifier from the manifest.
    pub external_id: String,
    /// Human-readable name.
    pub name: String,
    /// Cluster node this agent is pinned to.
    pub node_id: NodeId,
    /// Lifecycle machine (state + history).
    pub lifecycle: LifecycleMachine,
    /// When the agent record was created.
    pub started_at: Timestamp,
    /// Model the agent chats with, if any.
    pub model: Option<String>,
    /// Worker entry point (program and arguments), if the agent owns one.
    pub entry_point: Option<Vec<String>>,
    /// Declared capability names from the manifest.
    pub capabilities: Vec<String>,
    /// MCP servers the agent may reach.
    pub mcp_servers: Vec<String>,
    /// Raw permission grant specs from the manifest.
    pub permission_grants: Vec<String>,
    /// Trust categorization.
    pub trust_level: TrustLevel,
    /// The capability token minted at spawn, if any.
    pub permission_token_id: Option<TokenId>,
    /// Resource limits.
    pub limits: AgentLimits,
    /// Sliding rate window.
    pub usage_window: UsageWindow,
    /// Cumulative spend in USD.
    pub cost_usage_usd: f64,
    /// Consecutive task failures.
    pub error_count: u32,
    /// Whether the worker has reported ready.
    pub worker_ready: bool,
    /// In-flight worker tasks by id.
    pub worker_tasks: HashMap<String, WorkerTask>,
    /// Restarts attempted so far.
    pub restart_attempts: u32,
    /// Current restart backoff, milliseconds.
    pub restart_backoff_ms: u64,
    /// Set when a shutdown was requested but is still in flight.
    pub shutdown_requested: bool,
    /// Tools declared in the manifest.
    pub tools: Vec<String>,
    /// Cumulative token usage.
    pub token_usage: TokenUsage,
}

impl AgentEntry {
    /// Create a fresh entry pinned to `node_id`.
    #[must_use]
    pub fn new(external_id: impl Into<String>, name: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            id: AgentId::new(),
            external_id: external_id.into(),
            name: name.into(),
            node_id,
            lifecycle: LifecycleMachine::new(),
            started_at: Timestamp::now(),
            model: None,
            entry_point: None,
            capabilities: Vec::new(),
            mcp_servers: Vec::new(),
            permission_grants: Vec::new(),
            trust_level: TrustLevel::default(),
            permission_token_id: None,
            limits: AgentLimits::default(),
            usage_window: UsageWindow::default(),
            cost_usage_usd: 0.0,
            error_count: 0,
            worker_ready: false,
            worker_tasks: HashMap::new(),
            restart_attempts: 0,
            restart_backoff_ms: 0,
            shutdown_requested: false,
            tools: Vec::new(),
            token_usage: TokenUsage::default(),
        }
    }

    /// Record a task failure, returning the new consecutive count.
    pub fn record_error(&mut self) -> u32 {
        self.error_count = self.error_count.saturating_add(1);
        self.error_count
    }

    /// Reset the consecutive failure count after a success.
    pub fn clear_errors(&mut self) {
        self.error_count = 0;
    }

    /// Whether the failure threshold has been crossed.
    #[must_use]
    pub fn errors_exceeded(&self) -> bool {
        self.error_count >= self.limits.max_errors
    }
}
