//! Posture Toggle Manager
//!
//! Four independent network-posture dimensions (firewall, proxy, vpn, tor),
//! each either `simulated` (state flips without running anything) or backed
//! by operator-configured enable/disable commands run through the process
//! sandbox. At most one transition per dimension is in flight at a time;
//! a failed or timed-out transition reverts to the last known-good state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::{PostureConfig, PostureDimensionConfig, SandboxConfig};
use crate::error::GatewayError;
use crate::metrics;
use crate::sandbox::ProcessSandbox;
use crate::validator::Invocation;

/// A network posture dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostureDimension {
    Firewall,
    Proxy,
    Vpn,
    Tor,
}

impl PostureDimension {
    pub const ALL: [PostureDimension; 4] = [
        PostureDimension::Firewall,
        PostureDimension::Proxy,
        PostureDimension::Vpn,
        PostureDimension::Tor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostureDimension::Firewall => "firewall",
            PostureDimension::Proxy => "proxy",
            PostureDimension::Vpn => "vpn",
            PostureDimension::Tor => "tor",
        }
    }
}

impl FromStr for PostureDimension {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firewall" => Ok(PostureDimension::Firewall),
            "proxy" => Ok(PostureDimension::Proxy),
            "vpn" => Ok(PostureDimension::Vpn),
            "tor" => Ok(PostureDimension::Tor),
            other => Err(GatewayError::BadRequest(format!(
                "unknown posture dimension '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PostureDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostureState {
    Off,
    On,
    /// A transition command is currently running
    Transitioning,
    /// Enabled, but the dimension is a declared stub and nothing real ran
    Simulated,
}

impl std::fmt::Display for PostureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PostureState::Off => "off",
            PostureState::On => "on",
            PostureState::Transitioning => "transitioning",
            PostureState::Simulated => "simulated",
        };
        f.write_str(s)
    }
}

struct DimensionRuntime {
    config: PostureDimensionConfig,
    state: Mutex<PostureState>,
    /// Held for the whole transition; try-locked so a second caller gets
    /// an immediate conflict instead of queueing.
    transition: AsyncMutex<()>,
}

/// Owns all dimension state and serializes transitions.
pub struct PostureManager {
    dimensions: HashMap<PostureDimension, DimensionRuntime>,
    sandbox: Arc<ProcessSandbox>,
    sandbox_config: SandboxConfig,
}

impl PostureManager {
    /// Build the manager; every known dimension starts `Off`. Dimensions
    /// absent from the config are treated as simulated stubs.
    pub fn new(
        config: &PostureConfig,
        sandbox: Arc<ProcessSandbox>,
        sandbox_config: SandboxConfig,
    ) -> Self {
        let mut dimensions = HashMap::new();
        for dim in PostureDimension::ALL {
            let dim_config = config
                .dimensions
                .get(dim.as_str())
                .cloned()
                .unwrap_or(PostureDimensionConfig {
                    simulated: true,
                    timeout_secs: 30,
                    ..Default::default()
                });
            dimensions.insert(
                dim,
                DimensionRuntime {
                    config: dim_config,
                    state: Mutex::new(PostureState::Off),
                    transition: AsyncMutex::new(()),
                },
            );
        }
        Self {
            dimensions,
            sandbox,
            sandbox_config,
        }
    }

    /// Current state of every dimension, for `GET /posture`.
    pub fn status(&self) -> BTreeMap<String, PostureState> {
        self.dimensions
            .iter()
            .map(|(dim, rt)| (dim.as_str().to_string(), *rt.state.lock().unwrap()))
            .collect()
    }

    /// Current state of one dimension.
    pub fn state_of(&self, dimension: PostureDimension) -> PostureState {
        *self.dimensions[&dimension].state.lock().unwrap()
    }

    /// Transition one dimension toward enabled or disabled.
    ///
    /// Returns the resulting state. Idempotent: asking for the state the
    /// dimension is already in succeeds without running anything.
    ///
    /// # Errors
    ///
    /// - `Conflict` when this dimension, or one it conflicts with, is
    ///   already transitioning
    /// - `TransitionFailed` when the command failed or timed out; the
    ///   dimension reverts to its previous state
    pub async fn set(
        &self,
        dimension: PostureDimension,
        enabled: bool,
    ) -> Result<PostureState, GatewayError> {
        let runtime = &self.dimensions[&dimension];

        let _guard = runtime.transition.try_lock().map_err(|_| {
            metrics::POSTURE_TRANSITIONS_TOTAL
                .with_label_values(&[dimension.as_str(), "conflict"])
                .inc();
            GatewayError::Conflict {
                dimension: dimension.as_str().to_string(),
            }
        })?;

        self.check_cross_conflicts(dimension)?;

        let previous = *runtime.state.lock().unwrap();
        let target = if enabled {
            if runtime.config.simulated {
                PostureState::Simulated
            } else {
                PostureState::On
            }
        } else {
            PostureState::Off
        };

        if previous == target {
            return Ok(previous);
        }

        if runtime.config.simulated {
            *runtime.state.lock().unwrap() = target;
            info!(dimension = %dimension, state = %target, "simulated posture transition");
            metrics::POSTURE_TRANSITIONS_TOTAL
                .with_label_values(&[dimension.as_str(), "completed"])
                .inc();
            return Ok(target);
        }

        *runtime.state.lock().unwrap() = PostureState::Transitioning;

        let argv = if enabled {
            &runtime.config.enable
        } else {
            &runtime.config.disable
        };

        match self.run_transition(dimension, argv, runtime.config.timeout_secs).await {
            Ok(()) => {
                *runtime.state.lock().unwrap() = target;
                info!(dimension = %dimension, state = %target, "posture transition complete");
                metrics::POSTURE_TRANSITIONS_TOTAL
                    .with_label_values(&[dimension.as_str(), "completed"])
                    .inc();
                Ok(target)
            }
            Err(reason) => {
                // Revert to last known-good rather than guessing.
                *runtime.state.lock().unwrap() = previous;
                warn!(dimension = %dimension, reason = %reason, "posture transition failed, reverted");
                metrics::POSTURE_TRANSITIONS_TOTAL
                    .with_label_values(&[dimension.as_str(), "failed"])
                    .inc();
                Err(GatewayError::TransitionFailed {
                    dimension: dimension.as_str().to_string(),
                    state: previous.to_string(),
                })
            }
        }
    }

    /// A transition may not start while a conflicting dimension is mid-flight.
    fn check_cross_conflicts(&self, dimension: PostureDimension) -> Result<(), GatewayError> {
        let runtime = &self.dimensions[&dimension];
        for name in &runtime.config.conflicts_with {
            let Ok(other) = PostureDimension::from_str(name) else {
                continue;
            };
            let other_rt = &self.dimensions[&other];
            let busy = *other_rt.state.lock().unwrap() == PostureState::Transitioning
                || other_rt.transition.try_lock().is_err();
            if busy {
                metrics::POSTURE_TRANSITIONS_TOTAL
                    .with_label_values(&[dimension.as_str(), "conflict"])
                    .inc();
                return Err(GatewayError::Conflict {
                    dimension: other.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    async fn run_transition(
        &self,
        dimension: PostureDimension,
        argv: &[String],
        timeout_secs: u64,
    ) -> Result<(), String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "empty transition command".to_string())?;

        let invocation = Invocation::trusted(
            program.clone(),
            args.to_vec(),
            Duration::from_secs(timeout_secs.max(1)),
            self.sandbox_config.max_output_bytes,
            self.sandbox_config.scratch_dir.clone(),
            self.sandbox_config.env_allowlist.clone(),
        );

        let result = self
            .sandbox
            .execute(&invocation)
            .await
            .map_err(|e| format!("{} transition spawn failed: {}", dimension, e))?;

        if result.timed_out {
            return Err(format!("{} transition timed out", dimension));
        }
        match result.exit_code {
            Some(0) => Ok(()),
            code => Err(format!(
                "{} transition exited with {:?}: {}",
                dimension,
                code,
                result.stderr.trim()
            )),
        }
    }
}
