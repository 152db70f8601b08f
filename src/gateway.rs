//! Request pipeline
//!
//! Wires the stages together in a fixed order: auth, rate limit, validate,
//! execute, audit. Every request that reaches authentication produces
//! exactly one audit entry whatever its outcome, and every execution runs
//! in a task owned by the gateway so a caller disconnect cannot orphan or
//! cancel a child process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLogger, AuditSink, FileSink};
use crate::auth::{AuthGuard, PrivilegeTier};
use crate::config::Config;
use crate::error::GatewayError;
use crate::metrics;
use crate::policy::PolicyStore;
use crate::posture::{PostureDimension, PostureManager, PostureState};
use crate::rate_limit::RateLimiter;
use crate::sandbox::{ExecutionResult, ProcessSandbox};
use crate::validator::{CommandRequest, CommandValidator};

/// Successful execution response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Request id, also present in the audit trail and logs
    pub request_id: Uuid,

    #[serde(flatten)]
    pub result: ExecutionResult,
}

/// Desired end state of a posture transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostureTarget {
    On,
    Off,
}

impl PostureTarget {
    fn enabled(self) -> bool {
        matches!(self, PostureTarget::On)
    }

    fn as_str(self) -> &'static str {
        match self {
            PostureTarget::On => "on",
            PostureTarget::Off => "off",
        }
    }
}

/// Posture transition request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostureRequest {
    pub dimension: String,
    pub target: PostureTarget,
}

/// Posture transition response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostureResponse {
    pub dimension: String,
    pub state: PostureState,
}

/// What a caller is allowed to see about the gateway's surface: permitted
/// program names and their own identity. No patterns, no tiers of others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub identity: String,
    pub tier: PrivilegeTier,
    pub programs: Vec<String>,
}

/// The assembled pipeline.
pub struct Gateway {
    auth: AuthGuard,
    limiter: RateLimiter,
    policy: PolicyStore,
    validator: CommandValidator,
    sandbox: Arc<ProcessSandbox>,
    audit: AuditLogger,
    posture: PostureManager,
}

impl Gateway {
    /// Assemble the pipeline from configuration. Loads the policy file,
    /// starts the audit writer, and prepares the sandbox scratch directory.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let policy = PolicyStore::load_from_path(&config.policy.path)?;
        let sink: Arc<dyn AuditSink> = Arc::new(FileSink::new(&config.audit.path));
        let audit = AuditLogger::start(sink, config.audit.queue_capacity);
        Self::assemble(config, policy, audit)
    }

    /// Assemble with explicit policy and audit wiring (used by tests).
    pub fn assemble(
        config: &Config,
        policy: PolicyStore,
        audit: AuditLogger,
    ) -> anyhow::Result<Self> {
        let sandbox = Arc::new(ProcessSandbox::new(config.sandbox.clone())?);
        let posture = PostureManager::new(&config.posture, sandbox.clone(), config.sandbox.clone());
        Ok(Self {
            auth: AuthGuard::new(config.auth.keys.clone()),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            policy,
            validator: CommandValidator::new(config.sandbox.clone()),
            sandbox,
            audit,
            posture,
        })
    }

    /// Run one execute request through the whole pipeline.
    pub async fn handle_execute(
        &self,
        api_key: Option<&str>,
        request: CommandRequest,
    ) -> Result<ExecuteResponse, GatewayError> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();

        let outcome = self.execute_pipeline(api_key, &request, request_id).await;

        metrics::PIPELINE_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        metrics::RATE_BUCKETS_LIVE.set(self.limiter.bucket_count() as i64);

        outcome.map(|result| ExecuteResponse { request_id, result })
    }

    /// The staged pipeline itself. Every outcome is counted and audited at
    /// the point it is decided: rejections right here (no await point
    /// precedes them, so a dropped connection cannot skip them), executions
    /// inside the gateway-owned task below.
    async fn execute_pipeline(
        &self,
        api_key: Option<&str>,
        request: &CommandRequest,
        request_id: Uuid,
    ) -> Result<ExecutionResult, GatewayError> {
        let identity = match self.auth.authenticate(api_key) {
            Ok(identity) => identity,
            Err(err) => return Err(self.reject(request_id, "anonymous", request, err)),
        };

        if let Err(err) = self.limiter.allow(&identity) {
            return Err(self.reject(request_id, &identity.id, request, err));
        }

        let snapshot = self.policy.snapshot();
        let invocation = match self.validator.validate(request, &identity, &snapshot) {
            Ok(invocation) => invocation,
            Err(err) => return Err(self.reject(request_id, &identity.id, request, err)),
        };

        info!(
            request_id = %request_id,
            identity = %identity.id,
            program = invocation.program(),
            "dispatching execution"
        );

        // The child, its metrics, and its audit entry all live in a task
        // the gateway owns: if the caller drops the connection, only the
        // await below is cancelled. The execution still runs to completion,
        // gets reaped, and gets audited.
        let sandbox = self.sandbox.clone();
        let audit = self.audit.clone();
        let identity_id = identity.id.clone();
        let program = request.program.clone();
        let args = request.args.clone();
        let task = tokio::spawn(async move {
            let outcome = sandbox.execute(&invocation).await;
            match &outcome {
                Ok(result) => {
                    metrics::REQUESTS_TOTAL.with_label_values(&["completed"]).inc();
                    if result.timed_out {
                        metrics::EXECUTIONS_TIMED_OUT_TOTAL.inc();
                    }
                    audit.record(AuditEntry::new(
                        request_id,
                        identity_id,
                        program,
                        args,
                        "completed",
                        Some(result),
                    ));
                }
                Err(err) => {
                    metrics::REQUESTS_TOTAL.with_label_values(&[err.kind()]).inc();
                    metrics::REJECTIONS_TOTAL.with_label_values(&[err.kind()]).inc();
                    audit.record(AuditEntry::new(
                        request_id,
                        identity_id,
                        program,
                        args,
                        err.kind(),
                        None,
                    ));
                }
            }
            outcome
        });

        match task.await {
            Ok(outcome) => outcome,
            // The task only fails by panicking before it could record
            // anything, so the entry is written here instead.
            Err(e) => Err(self.reject(
                request_id,
                &identity.id,
                request,
                GatewayError::SandboxFault {
                    detail: format!("execution task failed: {}", e),
                },
            )),
        }
    }

    /// Count and audit a pre-execution rejection, then hand the error back.
    fn reject(
        &self,
        request_id: Uuid,
        identity: &str,
        request: &CommandRequest,
        err: GatewayError,
    ) -> GatewayError {
        metrics::REQUESTS_TOTAL.with_label_values(&[err.kind()]).inc();
        metrics::REJECTIONS_TOTAL.with_label_values(&[err.kind()]).inc();
        self.audit.record(AuditEntry::new(
            request_id,
            identity,
            request.program.clone(),
            request.args.clone(),
            err.kind(),
            None,
        ));
        err
    }

    /// Transition a posture dimension. Admin tier only.
    pub async fn handle_posture(
        &self,
        api_key: Option<&str>,
        request: PostureRequest,
    ) -> Result<PostureResponse, GatewayError> {
        let request_id = Uuid::new_v4();

        let outcome = self.posture_pipeline(api_key, &request).await;

        let (identity, outcome_label) = match &outcome {
            Ok((identity, _)) => (identity.clone(), "completed".to_string()),
            Err((identity, err)) => (identity.clone(), err.kind().to_string()),
        };
        self.audit.record(AuditEntry::new(
            request_id,
            identity,
            "posture",
            vec![request.dimension.clone(), request.target.as_str().to_string()],
            outcome_label,
            None,
        ));

        match outcome {
            Ok((_, state)) => Ok(PostureResponse {
                dimension: request.dimension,
                state,
            }),
            Err((_, err)) => Err(err),
        }
    }

    async fn posture_pipeline(
        &self,
        api_key: Option<&str>,
        request: &PostureRequest,
    ) -> Result<(String, PostureState), (String, GatewayError)> {
        let identity = self
            .auth
            .authenticate(api_key)
            .map_err(|e| ("anonymous".to_string(), e))?;

        // Same stage order as the execute pipeline: the budget is charged
        // before the tier is considered.
        self.limiter
            .allow(&identity)
            .map_err(|e| (identity.id.clone(), e))?;

        self.auth
            .require_tier(&identity, PrivilegeTier::Admin)
            .map_err(|e| {
                warn!(identity = %identity.id, "posture change refused: insufficient tier");
                (identity.id.clone(), e)
            })?;

        let dimension: PostureDimension = request
            .dimension
            .parse()
            .map_err(|e| (identity.id.clone(), e))?;

        let state = self
            .posture
            .set(dimension, request.target.enabled())
            .await
            .map_err(|e| (identity.id.clone(), e))?;

        Ok((identity.id, state))
    }

    /// Current posture of every dimension. Any valid key may read it.
    pub fn posture_status(
        &self,
        api_key: Option<&str>,
    ) -> Result<BTreeMap<String, PostureState>, GatewayError> {
        self.auth.authenticate(api_key)?;
        Ok(self.posture.status())
    }

    /// What this caller may do.
    pub fn capabilities(&self, api_key: Option<&str>) -> Result<Capabilities, GatewayError> {
        let identity = self.auth.authenticate(api_key)?;
        Ok(Capabilities {
            identity: identity.id,
            tier: identity.tier,
            programs: self.policy.snapshot().program_names(),
        })
    }

    /// Reload the policy file in place.
    pub fn reload_policy(&self, path: &str) -> anyhow::Result<usize> {
        self.policy.reload_from_path(path)
    }

    /// Drop rate buckets idle past their TTL.
    pub fn reclaim_rate_buckets(&self) -> usize {
        let removed = self.limiter.reclaim_idle();
        metrics::RATE_BUCKETS_LIVE.set(self.limiter.bucket_count() as i64);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use crate::config::{ApiKeyEntry, RateLimitSettings};
    use crate::policy::{ArgPatternSpec, PolicySet, RuleSpec};
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_policy() -> PolicySet {
        let mut specs = HashMap::new();
        specs.insert(
            "echo".to_string(),
            RuleSpec {
                patterns: vec![ArgPatternSpec::Regex {
                    regex: "[a-zA-Z0-9 ._-]{0,64}".to_string(),
                }],
                max_timeout_secs: 5,
                required_tier: PrivilegeTier::ReadOnly,
                ..Default::default()
            },
        );
        specs.insert(
            "sleep".to_string(),
            RuleSpec {
                patterns: vec![ArgPatternSpec::Regex {
                    regex: "[0-9]{1,4}".to_string(),
                }],
                max_timeout_secs: 2,
                required_tier: PrivilegeTier::Operator,
                ..Default::default()
            },
        );
        PolicySet::compile(specs).unwrap()
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.sandbox.scratch_dir = std::env::temp_dir().display().to_string();
        config.rate_limit = RateLimitSettings {
            enabled: false,
            ..Default::default()
        };
        config.auth.keys = vec![
            ApiKeyEntry {
                key: "op-key".to_string(),
                identity: "alice".to_string(),
                tier: PrivilegeTier::Operator,
            },
            ApiKeyEntry {
                key: "ro-key".to_string(),
                identity: "bob".to_string(),
                tier: PrivilegeTier::ReadOnly,
            },
            ApiKeyEntry {
                key: "admin-key".to_string(),
                identity: "root".to_string(),
                tier: PrivilegeTier::Admin,
            },
        ];
        config
    }

    fn gateway() -> (Gateway, Arc<MemorySink>) {
        let config = test_config();
        let (audit, sink) = AuditLogger::in_memory(64);
        let gateway =
            Gateway::assemble(&config, PolicyStore::new(test_policy()), audit).unwrap();
        (gateway, sink)
    }

    fn request(program: &str, args: &[&str]) -> CommandRequest {
        CommandRequest {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout_secs: None,
        }
    }

    async fn drain_audit() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_full_pipeline_success() {
        let (gateway, sink) = gateway();
        let response = gateway
            .handle_execute(Some("op-key"), request("echo", &["hello"]))
            .await
            .unwrap();
        assert_eq!(response.result.exit_code, Some(0));
        assert_eq!(response.result.stdout.trim(), "hello");

        drain_audit().await;
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, response.request_id);
        assert_eq!(entries[0].identity, "alice");
        assert_eq!(entries[0].outcome, "completed");
    }

    #[tokio::test]
    async fn test_unauthenticated_request_audited_as_anonymous() {
        let (gateway, sink) = gateway();
        let result = gateway
            .handle_execute(None, request("echo", &["hello"]))
            .await;
        assert!(matches!(result, Err(GatewayError::Unauthorized)));

        drain_audit().await;
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity, "anonymous");
        assert_eq!(entries[0].outcome, "unauthorized");
    }

    #[tokio::test]
    async fn test_denied_command_never_spawns_and_audits_once() {
        let (gateway, sink) = gateway();
        let result = gateway
            .handle_execute(Some("op-key"), request("rm", &["-rf", "/"]))
            .await;
        assert!(matches!(result, Err(GatewayError::PolicyDenied)));

        drain_audit().await;
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "policy_denied");
        // Nothing ran, so there is no execution summary.
        assert!(entries[0].execution.is_none());
    }

    #[tokio::test]
    async fn test_tier_enforced_through_pipeline() {
        let (gateway, _sink) = gateway();
        let result = gateway
            .handle_execute(Some("ro-key"), request("sleep", &["1"]))
            .await;
        assert!(matches!(result, Err(GatewayError::Forbidden)));
    }

    #[tokio::test]
    async fn test_timeout_is_a_result_not_an_error() {
        let (gateway, sink) = gateway();
        let response = gateway
            .handle_execute(Some("op-key"), request("sleep", &["30"]))
            .await
            .unwrap();
        assert!(response.result.timed_out);
        assert_eq!(response.result.exit_code, None);

        drain_audit().await;
        let entries = sink.entries();
        assert_eq!(entries[0].outcome, "completed");
        assert!(entries[0].execution.as_ref().unwrap().timed_out);
    }

    #[tokio::test]
    async fn test_rate_limited_request_audited() {
        let mut config = test_config();
        config.rate_limit = RateLimitSettings {
            enabled: true,
            read_only: crate::config::BucketSettings {
                burst: 1,
                per_minute: 1,
            },
            ..Default::default()
        };
        let (audit, sink) = AuditLogger::in_memory(64);
        let gateway =
            Gateway::assemble(&config, PolicyStore::new(test_policy()), audit).unwrap();

        gateway
            .handle_execute(Some("ro-key"), request("echo", &["one"]))
            .await
            .unwrap();
        let result = gateway
            .handle_execute(Some("ro-key"), request("echo", &["two"]))
            .await;
        assert!(matches!(result, Err(GatewayError::RateLimited { .. })));

        drain_audit().await;
        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].outcome, "rate_limited");
    }

    #[tokio::test]
    async fn test_posture_requires_admin() {
        let (gateway, _sink) = gateway();
        let result = gateway
            .handle_posture(
                Some("op-key"),
                PostureRequest {
                    dimension: "vpn".to_string(),
                    target: PostureTarget::On,
                },
            )
            .await;
        assert!(matches!(result, Err(GatewayError::Forbidden)));
    }

    #[tokio::test]
    async fn test_posture_rate_limit_checked_before_tier() {
        let mut config = test_config();
        config.rate_limit = RateLimitSettings {
            enabled: true,
            operator: crate::config::BucketSettings {
                burst: 1,
                per_minute: 1,
            },
            ..Default::default()
        };
        let (audit, _sink) = AuditLogger::in_memory(64);
        let gateway =
            Gateway::assemble(&config, PolicyStore::new(test_policy()), audit).unwrap();

        // Exhaust the operator's budget.
        gateway
            .handle_execute(Some("op-key"), request("echo", &["x"]))
            .await
            .unwrap();

        // An exhausted caller is limited before tier is considered, same
        // stage order as the execute pipeline.
        let result = gateway
            .handle_posture(
                Some("op-key"),
                PostureRequest {
                    dimension: "vpn".to_string(),
                    target: PostureTarget::On,
                },
            )
            .await;
        assert!(matches!(result, Err(GatewayError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_posture_transition_and_status() {
        let (gateway, sink) = gateway();
        let response = gateway
            .handle_posture(
                Some("admin-key"),
                PostureRequest {
                    dimension: "firewall".to_string(),
                    target: PostureTarget::On,
                },
            )
            .await
            .unwrap();
        // Default config declares every dimension simulated.
        assert_eq!(response.state, PostureState::Simulated);

        let status = gateway.posture_status(Some("ro-key")).unwrap();
        assert_eq!(status["firewall"], PostureState::Simulated);
        assert_eq!(status["tor"], PostureState::Off);

        drain_audit().await;
        let entries = sink.entries();
        assert_eq!(entries[0].program, "posture");
        assert_eq!(entries[0].args, vec!["firewall", "on"]);
    }

    #[tokio::test]
    async fn test_unknown_posture_dimension_rejected() {
        let (gateway, _sink) = gateway();
        let result = gateway
            .handle_posture(
                Some("admin-key"),
                PostureRequest {
                    dimension: "jetpack".to_string(),
                    target: PostureTarget::On,
                },
            )
            .await;
        assert!(matches!(result, Err(GatewayError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_capabilities_lists_programs_only() {
        let (gateway, _sink) = gateway();
        let caps = gateway.capabilities(Some("ro-key")).unwrap();
        assert_eq!(caps.identity, "bob");
        assert_eq!(caps.tier, PrivilegeTier::ReadOnly);
        assert_eq!(caps.programs, vec!["echo", "sleep"]);
    }

    #[tokio::test]
    async fn test_capabilities_requires_auth() {
        let (gateway, _sink) = gateway();
        assert!(gateway.capabilities(None).is_err());
    }

    #[tokio::test]
    async fn test_policy_reload_swaps_snapshot() {
        let (gateway, _sink) = gateway();
        gateway
            .handle_execute(Some("op-key"), request("echo", &["before"]))
            .await
            .unwrap();

        gateway.policy.replace(PolicySet::compile(HashMap::new()).unwrap());

        let result = gateway
            .handle_execute(Some("op-key"), request("echo", &["after"]))
            .await;
        assert!(matches!(result, Err(GatewayError::PolicyDenied)));
    }
}
