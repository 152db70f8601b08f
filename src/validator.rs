//! Command Validator
//!
//! Converts an untrusted [`CommandRequest`] into an [`Invocation`] or a
//! rejection. This is the only place an `Invocation` can be built: the
//! request is tokenized into an explicit argument vector (never handed to a
//! shell), checked against the policy snapshot default-deny, and its
//! timeout is clamped to the rule's ceiling.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::Identity;
use crate::config::SandboxConfig;
use crate::error::GatewayError;
use crate::policy::PolicySet;

/// Maximum length of the program name.
const MAX_PROGRAM_LEN: usize = 64;

/// Maximum length of a single argument.
const MAX_ARG_LEN: usize = 512;

/// Maximum number of arguments.
const MAX_ARGS: usize = 64;

/// Characters that would be dangerous if any downstream component ever
/// interpreted a value through a shell. Execution never uses a shell, but
/// the program name is held to this stricter standard anyway.
const SHELL_METACHARACTERS: [char; 11] =
    [';', '|', '&', '$', '`', '\n', '\r', '(', ')', '<', '>'];

/// An untrusted request to run a command. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    /// Program name (bare, no path)
    pub program: String,

    /// Argument vector
    #[serde(default)]
    pub args: Vec<String>,

    /// Optional timeout override; always clamped to the rule's maximum
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandRequest {
    /// Tokenize a raw command line into a request.
    ///
    /// Splitting is plain whitespace splitting: there is no quoting, no
    /// expansion, and no shell of any kind. Callers needing arguments with
    /// spaces must use the structured form.
    pub fn parse_line(line: &str) -> Result<Self, GatewayError> {
        let mut parts = line.split_whitespace().map(|s| s.to_string());
        let program = parts
            .next()
            .ok_or_else(|| GatewayError::BadRequest("empty command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout_secs: None,
        })
    }
}

/// A validated, fully-resolved execution order.
///
/// Fields are private and there is no public constructor: the only way to
/// obtain one is [`CommandValidator::validate`], so anything holding an
/// `Invocation` is known to have passed policy.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_cap: usize,
    working_dir: String,
    env_allowlist: Vec<String>,
    allow_network: bool,
}

impl Invocation {
    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument vector.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Clamped wall-clock timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Output cap per stream, in bytes.
    pub fn output_cap(&self) -> usize {
        self.output_cap
    }

    /// Working directory the child runs in.
    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    /// Environment variable names passed through to the child.
    pub fn env_allowlist(&self) -> &[String] {
        &self.env_allowlist
    }

    /// Whether the rule granted network access.
    pub fn allow_network(&self) -> bool {
        self.allow_network
    }

    /// Crate-internal constructor for operator-configured commands (posture
    /// transitions). These come from the local config file, not from a
    /// caller, so they do not pass through request validation.
    pub(crate) fn trusted(
        program: String,
        args: Vec<String>,
        timeout: Duration,
        output_cap: usize,
        working_dir: String,
        env_allowlist: Vec<String>,
    ) -> Self {
        Self {
            program,
            args,
            timeout,
            output_cap,
            working_dir,
            env_allowlist,
            allow_network: true,
        }
    }

    /// Test-only constructor so sandbox tests can execute known-safe
    /// commands without a policy file.
    #[cfg(test)]
    pub(crate) fn for_test(
        program: &str,
        args: &[&str],
        timeout: Duration,
        output_cap: usize,
    ) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout,
            output_cap,
            working_dir: std::env::temp_dir().display().to_string(),
            env_allowlist: vec!["PATH".to_string()],
            allow_network: false,
        }
    }
}

/// Validates requests against the policy snapshot.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    sandbox: SandboxConfig,
}

impl CommandValidator {
    /// Create a validator bound to the sandbox limits.
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self { sandbox }
    }

    /// Validate a request for an identity against a policy snapshot.
    ///
    /// # Errors
    ///
    /// - `BadRequest` for an empty program name
    /// - `PolicyDenied` for unknown programs, unmatched or malformed
    ///   arguments, and privileged rules the sandbox refuses to run
    /// - `Forbidden` when the identity's tier is below the rule's
    pub fn validate(
        &self,
        request: &CommandRequest,
        identity: &Identity,
        policy: &Arc<PolicySet>,
    ) -> Result<Invocation, GatewayError> {
        let program = request.program.trim();
        if program.is_empty() {
            return Err(GatewayError::BadRequest("empty command".to_string()));
        }

        if program.len() > MAX_PROGRAM_LEN
            || program.contains('/')
            || program.contains("..")
            || contains_control_chars(program)
            || program.contains(SHELL_METACHARACTERS)
        {
            debug!(identity = %identity.id, "program name rejected");
            return Err(GatewayError::PolicyDenied);
        }

        // Default-deny: unknown program means no rule, means no execution.
        let rule = policy.lookup(program).ok_or(GatewayError::PolicyDenied)?;

        // Fail closed before spawn: privileged rules only run when the
        // sandbox explicitly allows them.
        if rule.privileged && !self.sandbox.allow_privileged {
            debug!(program, "privileged rule refused by sandbox configuration");
            return Err(GatewayError::PolicyDenied);
        }

        if request.args.len() > MAX_ARGS {
            return Err(GatewayError::PolicyDenied);
        }
        for arg in &request.args {
            if arg.len() > MAX_ARG_LEN || contains_control_chars(arg) {
                return Err(GatewayError::PolicyDenied);
            }
            if !rule.arg_allowed(arg) {
                debug!(identity = %identity.id, program, "argument rejected by policy");
                return Err(GatewayError::PolicyDenied);
            }
        }

        if identity.tier < rule.required_tier {
            return Err(GatewayError::Forbidden);
        }

        // Duplicate flags resolve last-occurrence-wins; see resolve_duplicate_flags.
        let args = resolve_duplicate_flags(&request.args);

        // Never trust a caller-supplied timeout larger than policy.
        let requested = request
            .timeout_secs
            .unwrap_or(self.sandbox.default_timeout_secs);
        let timeout_secs = requested.min(rule.max_timeout_secs).max(1);

        // Per-rule env allow-list wins; empty defers to the sandbox-wide one.
        let env_allowlist = if rule.env_allowlist.is_empty() {
            self.sandbox.env_allowlist.clone()
        } else {
            rule.env_allowlist.clone()
        };

        Ok(Invocation {
            program: program.to_string(),
            args,
            timeout: Duration::from_secs(timeout_secs),
            output_cap: self.sandbox.max_output_bytes,
            working_dir: self.sandbox.scratch_dir.clone(),
            env_allowlist,
            allow_network: rule.allow_network,
        })
    }
}

fn contains_control_chars(s: &str) -> bool {
    s.chars().any(|c| c.is_control())
}

/// Resolve duplicate flags by keeping only the last occurrence of each
/// argument that looks like a flag (starts with `-`). A dropped flag takes
/// its separated value with it, so no orphaned value is left behind as a
/// positional argument. Relative order is otherwise preserved.
fn resolve_duplicate_flags(args: &[String]) -> Vec<String> {
    let mut result: Vec<String> = Vec::with_capacity(args.len());
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if arg.starts_with('-') && args[i + 1..].contains(arg) {
            // A later occurrence wins. Skip the value too when the next
            // token is not itself a flag.
            i += if args.get(i + 1).is_some_and(|next| !next.starts_with('-')) {
                2
            } else {
                1
            };
            continue;
        }
        result.push(arg.clone());
        i += 1;
    }
    result
}
