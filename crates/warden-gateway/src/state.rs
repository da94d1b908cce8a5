//! The gateway system object.
//!
//! One `Gateway` owns every subsystem and is threaded explicitly
//! through the handlers; there is no ambient global state. The daemon
//! constructs it once at startup, after the hardening gate passes.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use warden_audit::{ConsoleSink, FileSink, KvSink, MultiSink, Redactor};
use warden_capabilities::{CapabilityManager, SigningSecrets};
use warden_config::Config;
use warden_core::types::NodeId;
use warden_events::EventBus;
use warden_policy::{Decision, DomainRules, PolicyEngine, RuleSet, load_rule_set};
use warden_runtime::{AgentRegistry, LocalRateLimiter, RateLimitConfig, RateLimiter, Scheduler};
use warden_sandbox::SandboxRegistry;
use warden_storage::{KvStore, SqliteKvStore};

use crate::cluster::NodeDirectory;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::MetricsRegistry;
use crate::provider::LlmProvider;

/// The assembled control plane.
pub struct Gateway {
    /// Resolved configuration.
    pub config: Config,
    /// This node's cluster identity.
    pub node_id: NodeId,
    /// Policy engine behind an atomic swap for reload.
    policy: RwLock<Arc<PolicyEngine>>,
    /// Capability manager.
    pub capabilities: CapabilityManager,
    /// Rate limiter (local buckets by default).
    pub rate_limiter: Arc<dyn RateLimiter>,
    /// Event bus.
    pub bus: Arc<EventBus>,
    /// Audit multiplexer.
    pub audit: MultiSink,
    /// Agent records.
    pub agents: AgentRegistry,
    /// Sandbox registry.
    pub sandboxes: Arc<SandboxRegistry>,
    /// Background job runner.
    pub scheduler: Scheduler,
    /// Metrics registry.
    pub metrics: MetricsRegistry,
    /// Shared durable store.
    pub store: Arc<dyn KvStore>,
    /// LLM provider seam.
    pub provider: Arc<dyn LlmProvider>,
    /// Cluster node directory.
    pub directory: NodeDirectory,
    /// Startup instant, for uptime reporting.
    pub started_at: Instant,
}

impl Gateway {
    /// Assemble a gateway from resolved configuration.
    ///
    /// # Errors
    ///
    /// Store open failures, rule-set load failures, or pattern
    /// compilation failures.
    pub async fn build(
        config: Config,
        provider: Arc<dyn LlmProvider>,
    ) -> GatewayResult<Arc<Self>> {
        if let Some(parent) = config.database.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GatewayError::new(crate::error::ErrorCode::Internal, e.to_string())
                })?;
            }
        }
        let store: Arc<dyn KvStore> = Arc::new(
            SqliteKvStore::open(&config.database.path)
                .map_err(|e| GatewayError::new(crate::error::ErrorCode::Internal, e.to_string()))?,
        );
        Self::build_with_store(config, provider, store).await
    }

    /// [`Self::build`] over an explicit store (tests, embedded use).
    ///
    /// # Errors
    ///
    /// Rule-set load or compilation failures.
    pub async fn build_with_store(
        config: Config,
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn KvStore>,
    ) -> GatewayResult<Arc<Self>> {
        let rule_set = match &config.policy.rules_file {
            Some(path) => load_rule_set(path)
                .map_err(|e| GatewayError::validation(format!("rule set: {e}")))?,
            None => default_rule_set(&config.policy.default_decision),
        };
        let policy = Arc::new(
            PolicyEngine::new(&rule_set)
                .map_err(|e| GatewayError::validation(format!("rule set: {e}")))?,
        );

        let secrets = signing_secrets(&config);
        let capabilities = CapabilityManager::with_persistence(
            secrets,
            config.permissions.token_duration_ms,
            Arc::clone(&store),
        );
        match capabilities.load_persisted().await {
            Ok(restored) if restored > 0 => info!(restored, "restored capability tokens"),
            Ok(_) => {},
            Err(e) => warn!(error = %e, "failed to restore persisted capability tokens"),
        }

        let redactor = Redactor::with_patterns(
            default_redaction_patterns()
                .into_iter()
                .chain(config.audit.redaction_patterns.iter().cloned()),
        );
        let kv_sink = Arc::new(KvSink::new(Arc::clone(&store)));
        let mut audit = MultiSink::new()
            .with_redactor(redactor)
            .with_sink(Arc::new(ConsoleSink::new()))
            .with_sink(Arc::clone(&kv_sink) as Arc<dyn warden_audit::AuditSink>)
            .with_query_backend(kv_sink as Arc<dyn warden_audit::AuditQuery>);
        match FileSink::open(&config.audit.file_path, config.audit.file_max_bytes) {
            Ok(sink) => audit = audit.with_sink(Arc::new(sink)),
            Err(e) => warn!(error = %e, "audit file sink disabled"),
        }

        let bus = Arc::new(EventBus::new());
        let agents = AgentRegistry::new(Arc::clone(&bus));
        let rate_limiter: Arc<dyn RateLimiter> = Arc::new(LocalRateLimiter::new(RateLimitConfig {
            requests_per_minute: config.limits.requests_per_minute,
            tokens_per_minute: config.limits.tokens_per_minute,
            max_burst_requests: config.limits.max_burst_requests,
            max_burst_tokens: config.limits.max_burst_tokens,
        }));

        let node_id = NodeId::new(config.cluster.node_id.clone());
        let directory = NodeDirectory::new(Arc::clone(&store));
        if let Some(url) = &config.cluster.advertise_url {
            if let Err(e) = directory.register(&node_id, url).await {
                warn!(error = %e, "failed to register node in directory");
            }
        }

        let gateway = Arc::new(Self {
            config,
            node_id,
            policy: RwLock::new(policy),
            capabilities,
            rate_limiter,
            bus,
            audit,
            agents,
            sandboxes: Arc::new(SandboxRegistry::new()),
            scheduler: Scheduler::new(),
            metrics: MetricsRegistry::new(),
            store,
            provider,
            directory,
            started_at: Instant::now(),
        });
        gateway.register_jobs();
        Ok(gateway)
    }

    /// A test gateway: in-memory store, echo provider, anonymous auth,
    /// temp-dir audit file.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn for_tests(mut config: Config) -> Arc<Self> {
        config.server.anonymous = true;
        config.audit.file_path = std::env::temp_dir()
            .join("warden-test-audit")
            .join(format!("{}.log", uuid::Uuid::new_v4()));
        if config.permissions.signing_secret.is_none() {
            config.permissions.signing_secret =
                Some("warden-test-signing-secret-0000000001".to_string());
        }
        Self::build_with_store(
            config,
            Arc::new(crate::provider::EchoProvider::new()),
            warden_storage::MemoryKvStore::shared(),
        )
        .await
        .expect("test gateway build")
    }

    /// The current policy engine.
    #[must_use]
    pub fn policy(&self) -> Arc<PolicyEngine> {
        Arc::clone(
            &self
                .policy
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Atomically replace the policy engine (config reload). Readers
    /// in flight keep the engine they already cloned.
    pub fn reload_policy(&self, rule_set: &RuleSet) -> GatewayResult<()> {
        let engine = Arc::new(
            PolicyEngine::new(rule_set)
                .map_err(|e| GatewayError::validation(format!("rule set: {e}")))?,
        );
        *self
            .policy
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = engine;
        info!("policy rule set reloaded");
        Ok(())
    }

    /// The effective deadline for a request: the caller's ask clamped
    /// to the configured ceilings.
    #[must_use]
    pub fn effective_deadline(&self, requested_ms: Option<u64>) -> Duration {
        let ceiling = self.config.worker.max_task_timeout_ms;
        let requested = requested_ms.unwrap_or(self.config.worker.task_timeout_ms);
        Duration::from_millis(requested.min(ceiling))
    }

    fn register_jobs(self: &Arc<Self>) {
        // Expired capability pruning.
        let for_caps = Arc::clone(self);
        let _ = self.scheduler.register(
            "capability-prune",
            Duration::from_secs(300),
            Arc::new(move || {
                let gateway = Arc::clone(&for_caps);
                Box::pin(async move {
                    let pruned = gateway.capabilities.prune_expired();
                    if pruned > 0 {
                        info!(pruned, "pruned expired capability tokens");
                    }
                })
            }),
        );

        // Agent/sandbox reconciliation sweep.
        let for_monitor = Arc::clone(self);
        let _ = self.scheduler.register(
            "agent-monitor",
            Duration::from_secs(30),
            Arc::new(move || {
                let gateway = Arc::clone(&for_monitor);
                Box::pin(async move {
                    warden_runtime::sweep_agents(&gateway.agents, &gateway.sandboxes).await;
                })
            }),
        );

        // Daily audit retention cleanup.
        let for_retention = Arc::clone(self);
        let _ = self.scheduler.register(
            "audit-retention",
            Duration::from_secs(86_400),
            Arc::new(move || {
                let gateway = Arc::clone(&for_retention);
                Box::pin(async move {
                    gateway.prune_audit_retention().await;
                })
            }),
        );
    }

    /// Delete durable audit entries older than the retention window.
    pub async fn prune_audit_retention(&self) {
        let days = i64::from(self.config.audit.retention_days);
        let Some(cutoff) = chrono::Utc::now().checked_sub_signed(chrono::Duration::days(days))
        else {
            return;
        };
        let cutoff_millis = u64::try_from(cutoff.timestamp_millis()).unwrap_or(0);
        let cutoff_key = format!("{cutoff_millis:020}");

        let Ok(keys) = self.store.list_keys("audit").await else {
            return;
        };
        let mut removed = 0usize;
        for key in keys {
            // Keys are "{unix_millis:020}-{uuid}"; lexicographic order
            // is chronological.
            if key.as_str() < cutoff_key.as_str() {
                if self.store.delete("audit", &key).await.is_ok() {
                    removed = removed.saturating_add(1);
                }
            }
        }
        if removed > 0 {
            info!(removed, "audit retention cleanup");
        }
    }

    /// Graceful shutdown: stop jobs, drain sandboxes.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown(Duration::from_secs(5)).await;
        let terminated = self.sandboxes.terminate_all().await;
        info!(terminated, "gateway shut down");
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("node_id", &self.node_id)
            .field("agents", &self.agents.len())
            .field("sandboxes", &self.sandboxes.len())
            .finish_non_exhaustive()
    }
}

fn signing_secrets(config: &Config) -> SigningSecrets {
    let mut secrets = Vec::new();
    if let Some(secret) = &config.permissions.signing_secret {
        secrets.push(secret.clone());
    } else {
        // Development fallback: a random per-process secret. Tokens do
        // not survive restarts; the hardening gate requires a real one
        // in production.
        warn!("PERMISSION_SIGNING_SECRET not set; using an ephemeral secret");
        secrets.push(uuid::Uuid::new_v4().to_string());
    }
    secrets.extend(config.permissions.previous_secrets.iter().cloned());
    SigningSecrets::new(&secrets)
}

fn default_rule_set(default_decision: &str) -> RuleSet {
    let default = if default_decision == "allow" {
        Decision::Allow
    } else {
        Decision::Block
    };
    RuleSet {
        file: DomainRules {
            default,
            rules: Vec::new(),
        },
        network: DomainRules {
            default,
            rules: Vec::new(),
        },
        shell: DomainRules {
            default,
            rules: Vec::new(),
        },
    }
}

/// Summary block served by `/stats`.
#[derive(Debug, serde::Serialize)]
pub struct GatewayConfigSummary {
    /// Deployment environment label.
    pub environment: String,
    /// This node's id.
    pub node_id: String,
    /// Worker runtime in use.
    pub worker_runtime: String,
}

impl From<&Gateway> for GatewayConfigSummary {
    fn from(gateway: &Gateway) -> Self {
        Self {
            environment: gateway.config.environment.clone(),
            node_id: gateway.node_id.to_string(),
            worker_runtime: gateway.config.worker.runtime.clone(),
        }
    }
}


fn default_redaction_patterns() -> Vec<String> {
    vec![
        r"(?i)secret".to_string(),
        r"(?i)token".to_string(),
        r"(?i)password".to_string(),
        r"(?i)api[-_]?key".to_string(),
        r"(?i)authorization".to_string(),
        r"(?i)private[-_]?key".to_string(),
        r"(?i)credential".to_string(),
    ]
}
