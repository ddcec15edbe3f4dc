use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::GateType;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error in {path}: {message}")]
    Parse { path: String, message: String },
}

// ---------------------------------------------------------------------------
// SecretString
// ---------------------------------------------------------------------------

/// A string that never shows its value in Debug/Display output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Explicit accessor; the only way to read the value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretString(***)")
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***")
    }
}

// ---------------------------------------------------------------------------
// Effective config sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    None,
    Phase,
    Completion,
    Detect,
}

impl std::str::FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SyncStrategy::None),
            "phase" => Ok(SyncStrategy::Phase),
            "completion" => Ok(SyncStrategy::Completion),
            "detect" => Ok(SyncStrategy::Detect),
            other => Err(format!("unknown sync strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Squash,
    Merge,
    Rebase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    Always,
    OnSuccess,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub turn_secs: u64,
    pub phase_secs: u64,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub strategy: SyncStrategy,
    pub fail_on_conflict: bool,
    pub sync_on_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatesConfig {
    pub default: GateType,
    /// Per-phase gate overrides, merged key-wise across layers.
    pub overrides: HashMap<String, GateType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Markers whose presence in agent output declares phase completion.
    pub markers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiConfig {
    pub wait_for_checks: bool,
    pub merge_method: MergeMethod,
    /// Merge the PR server-side once checks are green (or immediately when
    /// not waiting on checks).
    pub auto_merge: bool,
    pub delete_branch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeConfig {
    pub create_pr: bool,
    pub pr_title_prefix: String,
    pub reviewers: Vec<String>,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub monthly_limit_usd: Option<f64>,
    /// Fraction of the limit at which an alert fires.
    pub alert_threshold: f64,
}

/// The fully resolved configuration a task executor runs with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub model: String,
    pub profile: String,
    pub agent_command: String,
    pub commit_prefix: String,
    pub target_branch: String,
    pub protected_branches: Vec<String>,
    pub executor_tag: Option<String>,
    pub team_server_url: Option<String>,
    pub auth_token: Option<SecretString>,
    pub artifact_skip_enabled: bool,
    pub worktree_cleanup: CleanupPolicy,
    pub timeouts: TimeoutConfig,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub gates: GatesConfig,
    pub completion: CompletionConfig,
    pub ci: CiConfig,
    pub finalize: FinalizeConfig,
    /// Named commands registry used by quality checks (tests, lint, ...).
    pub commands: HashMap<String, String>,
    pub budget: BudgetConfig,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".into(),
            profile: "default".into(),
            agent_command: "claude".into(),
            commit_prefix: "[orc]".into(),
            target_branch: "main".into(),
            protected_branches: vec![
                "main".into(),
                "master".into(),
                "develop".into(),
                "release/*".into(),
            ],
            executor_tag: None,
            team_server_url: None,
            auth_token: None,
            artifact_skip_enabled: true,
            worktree_cleanup: CleanupPolicy::OnSuccess,
            timeouts: TimeoutConfig {
                turn_secs: 600,
                phase_secs: 3_600,
                idle_secs: 120,
            },
            sync: SyncConfig {
                strategy: SyncStrategy::Completion,
                fail_on_conflict: true,
                sync_on_start: true,
            },
            retry: RetryConfig { max_retries: 2 },
            gates: GatesConfig {
                default: GateType::Auto,
                overrides: HashMap::new(),
            },
            completion: CompletionConfig {
                markers: vec!["PHASE_COMPLETE".into()],
            },
            ci: CiConfig {
                wait_for_checks: false,
                merge_method: MergeMethod::Squash,
                auto_merge: true,
                delete_branch: true,
            },
            finalize: FinalizeConfig {
                create_pr: true,
                pr_title_prefix: "[orc]".into(),
                reviewers: Vec::new(),
                labels: Vec::new(),
                assignees: Vec::new(),
            },
            commands: HashMap::new(),
            budget: BudgetConfig {
                monthly_limit_usd: None,
                alert_threshold: 0.8,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Field path -> the name of the source that won the merge for that field.
///
/// Only source names are recorded; secret values never appear here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance(BTreeMap<String, String>);

impl Provenance {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn set(&mut self, field: impl Into<String>, source: impl Into<String>) {
        self.0.insert(field.into(), source.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Partial (layer) config
// ---------------------------------------------------------------------------

/// One configuration layer before merging. Every field is optional so a
/// layer only overrides what it actually sets; booleans stay tri-state
/// (`None` = unset, distinguishable from `Some(false)`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub model: Option<String>,
    pub profile: Option<String>,
    pub agent_command: Option<String>,
    pub commit_prefix: Option<String>,
    pub target_branch: Option<String>,
    pub protected_branches: Option<Vec<String>>,
    pub executor_tag: Option<String>,
    pub team_server_url: Option<String>,
    pub auth_token: Option<String>,
    pub artifact_skip_enabled: Option<bool>,
    pub worktree_cleanup: Option<CleanupPolicy>,
    pub timeouts: PartialTimeouts,
    pub sync: PartialSync,
    pub retry: PartialRetry,
    pub gates: PartialGates,
    pub completion: PartialCompletion,
    pub ci: PartialCi,
    pub finalize: PartialFinalize,
    pub commands: Option<HashMap<String, String>>,
    pub budget: PartialBudget,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialTimeouts {
    pub turn_secs: Option<u64>,
    pub phase_secs: Option<u64>,
    pub idle_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialSync {
    pub strategy: Option<SyncStrategy>,
    pub fail_on_conflict: Option<bool>,
    pub sync_on_start: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialRetry {
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialGates {
    pub default: Option<GateType>,
    pub overrides: Option<HashMap<String, GateType>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialCompletion {
    pub markers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialCi {
    pub wait_for_checks: Option<bool>,
    pub merge_method: Option<MergeMethod>,
    pub auto_merge: Option<bool>,
    pub delete_branch: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialFinalize {
    pub create_pr: Option<bool>,
    pub pr_title_prefix: Option<String>,
    pub reviewers: Option<Vec<String>>,
    pub labels: Option<Vec<String>>,
    pub assignees: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialBudget {
    pub monthly_limit_usd: Option<f64>,
    pub alert_threshold: Option<f64>,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Known top-level keys; anything else in a config file is a warning.
const KNOWN_KEYS: &[&str] = &[
    "model",
    "profile",
    "agent_command",
    "commit_prefix",
    "target_branch",
    "protected_branches",
    "executor_tag",
    "team_server_url",
    "auth_token",
    "artifact_skip_enabled",
    "worktree_cleanup",
    "timeouts",
    "sync",
    "retry",
    "gates",
    "completion",
    "ci",
    "finalize",
    "commands",
    "budget",
];

/// Shared project config, tracked in git.
pub const SHARED_CONFIG: &str = ".orc/config.yaml";
/// Personal per-project overrides, gitignored.
pub const LOCAL_CONFIG: &str = ".orc/config.local.yaml";

pub struct ConfigResolver;

impl ConfigResolver {
    /// Merge the four layers for a project directory, lowest priority first:
    /// built-in defaults, shared project file, personal (home then project
    /// local), and the environment. Returns the effective config plus the
    /// per-field provenance of whichever source won.
    pub fn resolve(project_path: &Path) -> Result<(EffectiveConfig, Provenance), ConfigError> {
        Self::resolve_with_env(project_path, &env_overlay())
    }

    /// Same as [`resolve`] with an explicit env overlay (testable).
    pub fn resolve_with_env(
        project_path: &Path,
        env: &[(String, String)],
    ) -> Result<(EffectiveConfig, Provenance), ConfigError> {
        let mut effective = EffectiveConfig::default();
        let mut provenance = Provenance::default();
        stamp_all(&mut provenance, "defaults");

        let shared = project_path.join(SHARED_CONFIG);
        if shared.exists() {
            let partial = load_partial(&shared)?;
            apply_partial(&mut effective, &mut provenance, &partial, SHARED_CONFIG);
        }

        if let Some(home) = dirs::home_dir() {
            let personal = home.join(".orc/config.yaml");
            if personal.exists() {
                let partial = load_partial(&personal)?;
                apply_partial(&mut effective, &mut provenance, &partial, "~/.orc/config.yaml");
            }
        }

        let local = project_path.join(LOCAL_CONFIG);
        if local.exists() {
            let partial = load_partial(&local)?;
            apply_partial(&mut effective, &mut provenance, &partial, LOCAL_CONFIG);
        }

        apply_env(&mut effective, &mut provenance, env);

        Ok((effective, provenance))
    }

    /// Apply runtime flag overrides on top of a resolved config. Flags rank
    /// above everything, including the environment.
    pub fn apply_overrides(
        effective: &mut EffectiveConfig,
        provenance: &mut Provenance,
        overrides: &PartialConfig,
    ) {
        apply_partial(effective, provenance, overrides, "flags");
    }

    /// Resolve a prompt file by name: a personal file shadows a shared file
    /// of the same name whole-file, never key-by-key.
    pub fn resolve_prompt_path(project_path: &Path, name: &str) -> Option<PathBuf> {
        Self::resolve_prompt_path_in(project_path, name, dirs::home_dir().as_deref())
    }

    /// Same as [`resolve_prompt_path`] with an explicit home directory
    /// (testable).
    pub fn resolve_prompt_path_in(
        project_path: &Path,
        name: &str,
        home: Option<&Path>,
    ) -> Option<PathBuf> {
        let file = format!("{name}.md");
        if let Some(home) = home {
            let personal = home.join(".orc/prompts").join(&file);
            if personal.exists() {
                return Some(personal);
            }
        }
        let shared = project_path.join(".orc/prompts").join(&file);
        shared.exists().then_some(shared)
    }
}

fn load_partial(path: &Path) -> Result<PartialConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let value: serde_yaml::Value =
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    if let serde_yaml::Value::Mapping(map) = &value {
        for key in map.keys() {
            if let serde_yaml::Value::String(k) = key {
                if !KNOWN_KEYS.contains(&k.as_str()) {
                    tracing::warn!(path = %path.display(), key = %k, "unknown config key ignored");
                }
            }
        }
    }

    serde_yaml::from_value(value).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn stamp_all(prov: &mut Provenance, source: &str) {
    for field in [
        "model",
        "profile",
        "agent_command",
        "commit_prefix",
        "target_branch",
        "protected_branches",
        "artifact_skip_enabled",
        "worktree_cleanup",
        "timeouts.turn_secs",
        "timeouts.phase_secs",
        "timeouts.idle_secs",
        "sync.strategy",
        "sync.fail_on_conflict",
        "sync.sync_on_start",
        "retry.max_retries",
        "gates.default",
        "completion.markers",
        "ci.wait_for_checks",
        "ci.merge_method",
        "ci.auto_merge",
        "ci.delete_branch",
        "finalize.create_pr",
        "finalize.pr_title_prefix",
        "finalize.reviewers",
        "finalize.labels",
        "finalize.assignees",
        "budget.alert_threshold",
    ] {
        prov.set(field, source);
    }
}

fn apply_partial(
    eff: &mut EffectiveConfig,
    prov: &mut Provenance,
    p: &PartialConfig,
    source: &str,
) {
    if let Some(v) = &p.model {
        eff.model = v.clone();
        prov.set("model", source);
    }
    if let Some(v) = &p.profile {
        eff.profile = v.clone();
        prov.set("profile", source);
    }
    if let Some(v) = &p.agent_command {
        eff.agent_command = v.clone();
        prov.set("agent_command", source);
    }
    if let Some(v) = &p.commit_prefix {
        eff.commit_prefix = v.clone();
        prov.set("commit_prefix", source);
    }
    if let Some(v) = &p.target_branch {
        eff.target_branch = v.clone();
        prov.set("target_branch", source);
    }
    if let Some(v) = &p.protected_branches {
        eff.protected_branches = v.clone();
        prov.set("protected_branches", source);
    }
    if let Some(v) = &p.executor_tag {
        eff.executor_tag = Some(v.clone());
        prov.set("executor_tag", source);
    }
    if let Some(v) = &p.team_server_url {
        eff.team_server_url = Some(v.clone());
        prov.set("team_server_url", source);
    }
    if let Some(v) = &p.auth_token {
        eff.auth_token = Some(SecretString::new(v.clone()));
        prov.set("auth_token", source);
    }
    if let Some(v) = p.artifact_skip_enabled {
        eff.artifact_skip_enabled = v;
        prov.set("artifact_skip_enabled", source);
    }
    if let Some(v) = p.worktree_cleanup {
        eff.worktree_cleanup = v;
        prov.set("worktree_cleanup", source);
    }

    if let Some(v) = p.timeouts.turn_secs {
        eff.timeouts.turn_secs = v;
        prov.set("timeouts.turn_secs", source);
    }
    if let Some(v) = p.timeouts.phase_secs {
        eff.timeouts.phase_secs = v;
        prov.set("timeouts.phase_secs", source);
    }
    if let Some(v) = p.timeouts.idle_secs {
        eff.timeouts.idle_secs = v;
        prov.set("timeouts.idle_secs", source);
    }

    if let Some(v) = p.sync.strategy {
        eff.sync.strategy = v;
        prov.set("sync.strategy", source);
    }
    if let Some(v) = p.sync.fail_on_conflict {
        eff.sync.fail_on_conflict = v;
        prov.set("sync.fail_on_conflict", source);
    }
    if let Some(v) = p.sync.sync_on_start {
        eff.sync.sync_on_start = v;
        prov.set("sync.sync_on_start", source);
    }

    if let Some(v) = p.retry.max_retries {
        eff.retry.max_retries = v;
        prov.set("retry.max_retries", source);
    }

    if let Some(v) = p.gates.default {
        eff.gates.default = v;
        prov.set("gates.default", source);
    }
    if let Some(overrides) = &p.gates.overrides {
        // Maps merge key-wise; each key carries its own provenance.
        for (phase, gate) in overrides {
            eff.gates.overrides.insert(phase.clone(), *gate);
            prov.set(format!("gates.overrides.{phase}"), source);
        }
    }

    if let Some(v) = &p.completion.markers {
        eff.completion.markers = v.clone();
        prov.set("completion.markers", source);
    }

    if let Some(v) = p.ci.wait_for_checks {
        eff.ci.wait_for_checks = v;
        prov.set("ci.wait_for_checks", source);
    }
    if let Some(v) = p.ci.merge_method {
        eff.ci.merge_method = v;
        prov.set("ci.merge_method", source);
    }
    if let Some(v) = p.ci.auto_merge {
        eff.ci.auto_merge = v;
        prov.set("ci.auto_merge", source);
    }
    if let Some(v) = p.ci.delete_branch {
        eff.ci.delete_branch = v;
        prov.set("ci.delete_branch", source);
    }

    if let Some(v) = p.finalize.create_pr {
        eff.finalize.create_pr = v;
        prov.set("finalize.create_pr", source);
    }
    if let Some(v) = &p.finalize.pr_title_prefix {
        eff.finalize.pr_title_prefix = v.clone();
        prov.set("finalize.pr_title_prefix", source);
    }
    if let Some(v) = &p.finalize.reviewers {
        eff.finalize.reviewers = v.clone();
        prov.set("finalize.reviewers", source);
    }
    if let Some(v) = &p.finalize.labels {
        eff.finalize.labels = v.clone();
        prov.set("finalize.labels", source);
    }
    if let Some(v) = &p.finalize.assignees {
        eff.finalize.assignees = v.clone();
        prov.set("finalize.assignees", source);
    }

    if let Some(commands) = &p.commands {
        for (name, cmd) in commands {
            eff.commands.insert(name.clone(), cmd.clone());
            prov.set(format!("commands.{name}"), source);
        }
    }

    if let Some(v) = p.budget.monthly_limit_usd {
        eff.budget.monthly_limit_usd = Some(v);
        prov.set("budget.monthly_limit_usd", source);
    }
    if let Some(v) = p.budget.alert_threshold {
        eff.budget.alert_threshold = v;
        prov.set("budget.alert_threshold", source);
    }
}

/// Snapshot the `ORC_*` environment.
pub fn env_overlay() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("ORC_"))
        .collect()
}

fn apply_env(eff: &mut EffectiveConfig, prov: &mut Provenance, env: &[(String, String)]) {
    for (key, value) in env {
        let source = format!("${key}");
        match key.as_str() {
            "ORC_MODEL" => {
                eff.model = value.clone();
                prov.set("model", source);
            }
            "ORC_PROFILE" => {
                eff.profile = value.clone();
                prov.set("profile", source);
            }
            "ORC_AGENT_COMMAND" => {
                eff.agent_command = value.clone();
                prov.set("agent_command", source);
            }
            "ORC_COMMIT_PREFIX" => {
                eff.commit_prefix = value.clone();
                prov.set("commit_prefix", source);
            }
            "ORC_TARGET_BRANCH" => {
                eff.target_branch = value.clone();
                prov.set("target_branch", source);
            }
            "ORC_EXECUTOR_TAG" => {
                eff.executor_tag = Some(value.clone());
                prov.set("executor_tag", source);
            }
            "ORC_TEAM_SERVER_URL" => {
                eff.team_server_url = Some(value.clone());
                prov.set("team_server_url", source);
            }
            "ORC_AUTH_TOKEN" => {
                eff.auth_token = Some(SecretString::new(value.clone()));
                prov.set("auth_token", source);
            }
            "ORC_TURN_TIMEOUT_SECS" => {
                if let Ok(v) = value.parse() {
                    eff.timeouts.turn_secs = v;
                    prov.set("timeouts.turn_secs", source);
                }
            }
            "ORC_PHASE_TIMEOUT_SECS" => {
                if let Ok(v) = value.parse() {
                    eff.timeouts.phase_secs = v;
                    prov.set("timeouts.phase_secs", source);
                }
            }
            "ORC_IDLE_TIMEOUT_SECS" => {
                if let Ok(v) = value.parse() {
                    eff.timeouts.idle_secs = v;
                    prov.set("timeouts.idle_secs", source);
                }
            }
            "ORC_SYNC_STRATEGY" => {
                if let Ok(v) = value.parse() {
                    eff.sync.strategy = v;
                    prov.set("sync.strategy", source);
                }
            }
            "ORC_MAX_RETRIES" => {
                if let Ok(v) = value.parse() {
                    eff.retry.max_retries = v;
                    prov.set("retry.max_retries", source);
                }
            }
            "ORC_CI_WAIT" => {
                if let Ok(v) = value.parse() {
                    eff.ci.wait_for_checks = v;
                    prov.set("ci.wait_for_checks", source);
                }
            }
            _ => {
                tracing::debug!(key = %key, "unrecognised ORC_ env var ignored");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn defaults_have_full_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, prov) =
            ConfigResolver::resolve_with_env(dir.path(), &[]).unwrap();
        assert_eq!(cfg.model, "sonnet");
        assert_eq!(prov.get("model"), Some("defaults"));
        assert_eq!(prov.get("sync.strategy"), Some("defaults"));
        // No field escapes provenance.
        for (_, source) in prov.iter() {
            assert!(!source.is_empty());
        }
    }

    #[test]
    fn shared_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(SHARED_CONFIG),
            "model: opus\nsync:\n  strategy: phase\n",
        );
        let (cfg, prov) =
            ConfigResolver::resolve_with_env(dir.path(), &[]).unwrap();
        assert_eq!(cfg.model, "opus");
        assert_eq!(cfg.sync.strategy, SyncStrategy::Phase);
        assert_eq!(prov.get("model"), Some(SHARED_CONFIG));
        // Untouched fields stay attributed to defaults.
        assert_eq!(prov.get("commit_prefix"), Some("defaults"));
    }

    #[test]
    fn local_layer_overrides_shared() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join(SHARED_CONFIG), "model: opus\n");
        write(&dir.path().join(LOCAL_CONFIG), "model: haiku\n");
        let (cfg, prov) =
            ConfigResolver::resolve_with_env(dir.path(), &[]).unwrap();
        assert_eq!(cfg.model, "haiku");
        assert_eq!(prov.get("model"), Some(LOCAL_CONFIG));
    }

    #[test]
    fn env_ranks_above_files() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join(SHARED_CONFIG), "model: opus\n");
        let env = vec![("ORC_MODEL".to_string(), "haiku".to_string())];
        let (cfg, prov) = ConfigResolver::resolve_with_env(dir.path(), &env).unwrap();
        assert_eq!(cfg.model, "haiku");
        assert_eq!(prov.get("model"), Some("$ORC_MODEL"));
    }

    #[test]
    fn flags_rank_above_env() {
        let dir = tempfile::tempdir().unwrap();
        let env = vec![("ORC_MODEL".to_string(), "haiku".to_string())];
        let (mut cfg, mut prov) =
            ConfigResolver::resolve_with_env(dir.path(), &env).unwrap();
        let overrides = PartialConfig {
            model: Some("opus".into()),
            ..PartialConfig::default()
        };
        ConfigResolver::apply_overrides(&mut cfg, &mut prov, &overrides);
        assert_eq!(cfg.model, "opus");
        assert_eq!(prov.get("model"), Some("flags"));
    }

    #[test]
    fn explicit_false_overrides_lower_true() {
        // Tri-state booleans: a layer setting `false` must win over a lower
        // layer's `true`, which requires unset != false during the merge.
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(SHARED_CONFIG),
            "sync:\n  fail_on_conflict: true\n",
        );
        write(
            &dir.path().join(LOCAL_CONFIG),
            "sync:\n  fail_on_conflict: false\n",
        );
        let (cfg, prov) =
            ConfigResolver::resolve_with_env(dir.path(), &[]).unwrap();
        assert!(!cfg.sync.fail_on_conflict);
        assert_eq!(prov.get("sync.fail_on_conflict"), Some(LOCAL_CONFIG));
    }

    #[test]
    fn maps_merge_keywise() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(SHARED_CONFIG),
            "commands:\n  tests: cargo test\n  lint: cargo clippy\n",
        );
        write(
            &dir.path().join(LOCAL_CONFIG),
            "commands:\n  tests: cargo nextest run\n",
        );
        let (cfg, prov) =
            ConfigResolver::resolve_with_env(dir.path(), &[]).unwrap();
        assert_eq!(cfg.commands["tests"], "cargo nextest run");
        assert_eq!(cfg.commands["lint"], "cargo clippy");
        assert_eq!(prov.get("commands.tests"), Some(LOCAL_CONFIG));
        assert_eq!(prov.get("commands.lint"), Some(SHARED_CONFIG));
    }

    #[test]
    fn gate_overrides_merge_keywise() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(SHARED_CONFIG),
            "gates:\n  overrides:\n    merge: human\n",
        );
        let (cfg, _) = ConfigResolver::resolve_with_env(dir.path(), &[]).unwrap();
        assert_eq!(cfg.gates.overrides["merge"], GateType::Human);
        assert_eq!(cfg.gates.default, GateType::Auto);
    }

    #[test]
    fn secret_never_prints() {
        let secret = SecretString::new("tok_abc123");
        assert_eq!(format!("{secret}"), "***");
        assert_eq!(format!("{secret:?}"), "SecretString(***)");
        assert_eq!(secret.expose(), "tok_abc123");
    }

    #[test]
    fn personal_file_shadows_shared_file() {
        // Whole-file shadowing: a personal prompt with the same name wins
        // outright; other names still come from the shared directory.
        let project = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();

        write(
            &project.path().join(".orc/prompts/implement.md"),
            "shared implement",
        );
        write(
            &project.path().join(".orc/prompts/test.md"),
            "shared test",
        );
        write(
            &home.path().join(".orc/prompts/implement.md"),
            "personal implement",
        );

        let implement = ConfigResolver::resolve_prompt_path_in(
            project.path(),
            "implement",
            Some(home.path()),
        )
        .unwrap();
        assert!(implement.starts_with(home.path()));

        let test = ConfigResolver::resolve_prompt_path_in(
            project.path(),
            "test",
            Some(home.path()),
        )
        .unwrap();
        assert!(test.starts_with(project.path()));

        assert!(ConfigResolver::resolve_prompt_path_in(
            project.path(),
            "missing",
            Some(home.path())
        )
        .is_none());
    }

    #[test]
    fn unknown_keys_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join(SHARED_CONFIG),
            "model: opus\nfrobnicate: true\n",
        );
        let (cfg, _) = ConfigResolver::resolve_with_env(dir.path(), &[]).unwrap();
        assert_eq!(cfg.model, "opus");
    }
}
