//! Policy Store
//!
//! The authoritative whitelist of permitted commands and their argument
//! constraints. Policy is loaded from a TOML file at startup and can be
//! reloaded at runtime: readers hold an `Arc` snapshot, so a reload swaps
//! the whole set atomically and in-flight validations/executions keep the
//! snapshot they started with.
//!
//! Policy file format:
//!
//! ```toml
//! [commands.ping]
//! patterns = [
//!     { exact = "-c" },
//!     { regex = "[0-9]{1,3}" },
//!     { any_of = ["127.0.0.1", "localhost"] },
//! ]
//! max_timeout_secs = 10
//! required_tier = "read_only"
//! allow_network = true
//! ```

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::auth::PrivilegeTier;

/// One accepted argument form. Regexes match the whole argument, not a
/// substring.
#[derive(Debug, Clone)]
pub enum ArgPattern {
    /// Argument must equal this string exactly
    Exact(String),
    /// Argument must fully match this regex
    Regex(Regex),
    /// Argument must equal one of these strings
    AnyOf(Vec<String>),
}

impl ArgPattern {
    /// Whether `arg` satisfies this pattern.
    pub fn matches(&self, arg: &str) -> bool {
        match self {
            ArgPattern::Exact(expected) => arg == expected,
            ArgPattern::Regex(re) => re.is_match(arg),
            ArgPattern::AnyOf(options) => options.iter().any(|o| o == arg),
        }
    }
}

/// Serialized form of an argument pattern in the policy file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ArgPatternSpec {
    /// `{ exact = "-c" }`
    Exact { exact: String },
    /// `{ regex = "[0-9]+" }`
    Regex { regex: String },
    /// `{ any_of = ["a", "b"] }`
    AnyOf { any_of: Vec<String> },
}

impl ArgPatternSpec {
    fn compile(&self) -> Result<ArgPattern> {
        match self {
            ArgPatternSpec::Exact { exact } => Ok(ArgPattern::Exact(exact.clone())),
            ArgPatternSpec::Regex { regex } => {
                // Anchor so a pattern like "[0-9]+" cannot be satisfied by
                // "1; rm" via substring match.
                let anchored = format!("^(?:{})$", regex);
                let re = Regex::new(&anchored)
                    .with_context(|| format!("Invalid argument regex: {}", regex))?;
                Ok(ArgPattern::Regex(re))
            }
            ArgPatternSpec::AnyOf { any_of } => Ok(ArgPattern::AnyOf(any_of.clone())),
        }
    }
}

/// Serialized form of one command rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleSpec {
    /// Accepted argument forms; an argument must match at least one.
    /// An empty list means the command takes no arguments.
    pub patterns: Vec<ArgPatternSpec>,

    /// Hard ceiling on execution time for this command
    pub max_timeout_secs: u64,

    /// Minimum privilege tier required to run this command
    pub required_tier: PrivilegeTier,

    /// Whether the child may use the network
    pub allow_network: bool,

    /// Whether the command needs elevated OS privileges. Such rules only
    /// run when the sandbox is configured to allow them; otherwise they
    /// fail closed before spawn.
    pub privileged: bool,

    /// Environment variables passed through for this command. Empty means
    /// the sandbox-wide allow-list applies.
    pub env_allowlist: Vec<String>,
}

impl Default for RuleSpec {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            max_timeout_secs: 30,
            required_tier: PrivilegeTier::Operator,
            allow_network: false,
            privileged: false,
            env_allowlist: Vec::new(),
        }
    }
}

/// A compiled, ready-to-check rule for one program.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    /// Program name (bare, no path)
    pub program: String,

    /// Compiled accepted argument forms
    pub patterns: Vec<ArgPattern>,

    /// Hard ceiling on execution time
    pub max_timeout_secs: u64,

    /// Minimum privilege tier
    pub required_tier: PrivilegeTier,

    /// Whether the child may use the network
    pub allow_network: bool,

    /// Whether the command needs elevated OS privileges
    pub privileged: bool,

    /// Per-rule environment allow-list; empty defers to the sandbox's
    pub env_allowlist: Vec<String>,
}

impl PolicyRule {
    /// Whether a single argument satisfies any accepted pattern.
    pub fn arg_allowed(&self, arg: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(arg))
    }
}

/// On-disk policy file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    commands: HashMap<String, RuleSpec>,
}

/// An immutable compiled policy snapshot.
#[derive(Debug, Default)]
pub struct PolicySet {
    rules: HashMap<String, PolicyRule>,
}

impl PolicySet {
    /// Compile a policy set from raw rule specs.
    pub fn compile(specs: HashMap<String, RuleSpec>) -> Result<Self> {
        let mut rules = HashMap::new();
        for (program, spec) in specs {
            if program.is_empty() {
                anyhow::bail!("Policy contains a rule with an empty program name");
            }
            if program.contains('/') || program.contains("..") {
                anyhow::bail!(
                    "Policy rule '{}' must use a bare program name, not a path",
                    program
                );
            }
            if spec.max_timeout_secs == 0 {
                anyhow::bail!("Policy rule '{}' has zero max_timeout_secs", program);
            }
            let patterns = spec
                .patterns
                .iter()
                .map(|p| p.compile())
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("In policy rule '{}'", program))?;
            rules.insert(
                program.clone(),
                PolicyRule {
                    program,
                    patterns,
                    max_timeout_secs: spec.max_timeout_secs,
                    required_tier: spec.required_tier,
                    allow_network: spec.allow_network,
                    privileged: spec.privileged,
                    env_allowlist: spec.env_allowlist,
                },
            );
        }
        Ok(Self { rules })
    }

    /// Parse and compile a policy file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file from {:?}", path))?;
        let file: PolicyFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse policy file from {:?}", path))?;
        Self::compile(file.commands)
    }

    /// Look up the rule for a program name. Unknown program means denied.
    pub fn lookup(&self, program: &str) -> Option<&PolicyRule> {
        self.rules.get(program)
    }

    /// Permitted program names, sorted. Exposed by `/capabilities`;
    /// deliberately names only, no patterns.
    pub fn program_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Shared handle to the current policy snapshot.
///
/// Readers call [`PolicyStore::snapshot`] and keep the returned `Arc` for
/// the duration of one request; a concurrent reload never tears a policy
/// in half under them.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    current: Arc<RwLock<Arc<PolicySet>>>,
}

impl PolicyStore {
    /// Wrap an initial policy set.
    pub fn new(set: PolicySet) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(set))),
        }
    }

    /// Load the store from a policy file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(PolicySet::load_from_path(path)?))
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<PolicySet> {
        self.current.read().unwrap().clone()
    }

    /// Replace the policy atomically. The new set is fully parsed and
    /// compiled before the swap, so a bad file leaves the old policy
    /// untouched.
    pub fn reload_from_path<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let set = PolicySet::load_from_path(path)?;
        let count = set.len();
        *self.current.write().unwrap() = Arc::new(set);
        tracing::info!(rules = count, "Policy reloaded");
        Ok(count)
    }

    /// Replace the policy with an already-compiled set (used by tests).
    pub fn replace(&self, set: PolicySet) {
        *self.current.write().unwrap() = Arc::new(set);
    }
}
