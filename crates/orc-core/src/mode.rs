use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{EffectiveConfig, SHARED_CONFIG};

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Execution mode. Controls only whether identity prefixing and advisory
/// coordination are active; the executor state machine is identical in all
/// three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Single user, no identity, no locking, no sync overhead.
    Solo,
    /// Shared project config present; identity prefixing active.
    P2p,
    /// Team server configured; advisory locks layered on top.
    Team,
}

impl Mode {
    /// Whether task ids and branches carry an executor prefix/tag.
    pub fn uses_identity(&self) -> bool {
        !matches!(self, Mode::Solo)
    }

    /// Whether advisory coordination is layered on.
    pub fn uses_locking(&self) -> bool {
        matches!(self, Mode::Team)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Mode::Solo => "solo",
            Mode::P2p => "p2p",
            Mode::Team => "team",
        };
        write!(f, "{}", label)
    }
}

/// Pure function of the resolved config and the project directory:
/// team server URL -> team; shared project config on disk -> p2p; else solo.
pub fn detect(config: &EffectiveConfig, project_path: &Path) -> Mode {
    if config.team_server_url.is_some() {
        return Mode::Team;
    }
    if project_path.join(SHARED_CONFIG).exists() {
        return Mode::P2p;
    }
    Mode::Solo
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EffectiveConfig;

    #[test]
    fn solo_without_shared_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EffectiveConfig::default();
        assert_eq!(detect(&cfg, dir.path()), Mode::Solo);
    }

    #[test]
    fn p2p_with_shared_config() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join(SHARED_CONFIG);
        std::fs::create_dir_all(shared.parent().unwrap()).unwrap();
        std::fs::write(&shared, "model: sonnet\n").unwrap();
        let cfg = EffectiveConfig::default();
        assert_eq!(detect(&cfg, dir.path()), Mode::P2p);
    }

    #[test]
    fn team_wins_over_shared_config() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join(SHARED_CONFIG);
        std::fs::create_dir_all(shared.parent().unwrap()).unwrap();
        std::fs::write(&shared, "model: sonnet\n").unwrap();
        let cfg = EffectiveConfig {
            team_server_url: Some("https://orc.example.com".into()),
            ..EffectiveConfig::default()
        };
        assert_eq!(detect(&cfg, dir.path()), Mode::Team);
        assert!(Mode::Team.uses_identity());
        assert!(Mode::Team.uses_locking());
        assert!(!Mode::Solo.uses_identity());
    }
}
