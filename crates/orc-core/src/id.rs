use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("invalid task id: {0}")]
    InvalidTaskId(String),
}

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// A task identifier of the form `TASK-NNN` or `TASK-<PREFIX>-NNN`.
///
/// The prefix is present only in p2p/team modes, where it is derived from the
/// executor tag so that two people working on the same backlog never collide
/// on ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    prefix: Option<String>,
    number: u32,
}

impl TaskId {
    /// Build an id without a prefix (solo mode).
    pub fn new(number: u32) -> Self {
        Self {
            prefix: None,
            number,
        }
    }

    /// Build an id with an executor prefix (p2p/team modes).
    ///
    /// The prefix is upper-cased for display; parsing accepts any case.
    pub fn with_prefix(prefix: impl Into<String>, number: u32) -> Self {
        Self {
            prefix: Some(prefix.into().to_uppercase()),
            number,
        }
    }

    /// Parse `TASK-NNN` / `TASK-PREFIX-NNN`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let rest = s
            .strip_prefix("TASK-")
            .ok_or_else(|| IdError::InvalidTaskId(s.to_string()))?;

        // The numeric part is always the last dash-separated segment.
        let (prefix, num_str) = match rest.rsplit_once('-') {
            Some((p, n)) => (Some(p), n),
            None => (None, rest),
        };

        if let Some(p) = prefix {
            if p.is_empty() || !p.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(IdError::InvalidTaskId(s.to_string()));
            }
        }

        let number = num_str
            .parse::<u32>()
            .map_err(|_| IdError::InvalidTaskId(s.to_string()))?;

        Ok(Self {
            prefix: prefix.map(|p| p.to_uppercase()),
            number,
        })
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Branch name for this task: `orc/<taskid>[-<tag>]`, lower-cased.
    pub fn branch_name(&self, executor_tag: Option<&str>) -> String {
        match executor_tag {
            Some(tag) => format!("orc/{}-{}", self, tag.to_lowercase()).to_lowercase(),
            None => format!("orc/{}", self).to_lowercase(),
        }
    }

    /// Worktree directory name, mirroring the branch name without the
    /// `orc/` prefix: `<taskid>[-<tag>]`, lower-cased.
    pub fn worktree_name(&self, executor_tag: Option<&str>) -> String {
        match executor_tag {
            Some(tag) => format!("{}-{}", self, tag.to_lowercase()).to_lowercase(),
            None => self.to_string().to_lowercase(),
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.prefix {
            Some(p) => write!(f, "TASK-{}-{:03}", p, self.number),
            None => write!(f, "TASK-{:03}", self.number),
        }
    }
}

impl TryFrom<String> for TaskId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.to_string()
    }
}

impl std::str::FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Sanitize an executor tag for use in branch / directory names.
///
/// Tags come from user initials or hostnames; anything that is not
/// alphanumeric, `-` or `_` is replaced with `-`.
pub fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_solo_id() {
        let id = TaskId::parse("TASK-042").unwrap();
        assert_eq!(id.prefix(), None);
        assert_eq!(id.number(), 42);
        assert_eq!(id.to_string(), "TASK-042");
    }

    #[test]
    fn parse_prefixed_id() {
        let id = TaskId::parse("TASK-RM-007").unwrap();
        assert_eq!(id.prefix(), Some("RM"));
        assert_eq!(id.number(), 7);
        assert_eq!(id.to_string(), "TASK-RM-007");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(TaskId::parse("TASK-").is_err());
        assert!(TaskId::parse("TICKET-001").is_err());
        assert!(TaskId::parse("TASK-RM-").is_err());
        assert!(TaskId::parse("TASK--001").is_err());
        assert!(TaskId::parse("TASK-R M-001").is_err());
    }

    #[test]
    fn prefix_is_uppercased() {
        let id = TaskId::with_prefix("rm", 3);
        assert_eq!(id.to_string(), "TASK-RM-003");
        assert_eq!(TaskId::parse("task-rm-003").err().map(|_| ()), Some(()));
    }

    #[test]
    fn branch_names_are_lowercase() {
        let id = TaskId::with_prefix("RM", 12);
        assert_eq!(id.branch_name(None), "orc/task-rm-012");
        assert_eq!(id.branch_name(Some("JD")), "orc/task-rm-012-jd");
        assert_eq!(id.worktree_name(Some("JD")), "task-rm-012-jd");
    }

    #[test]
    fn serde_roundtrip() {
        let id = TaskId::with_prefix("AB", 5);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"TASK-AB-005\"");
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn sanitize_tag_replaces_special_chars() {
        assert_eq!(sanitize_tag("J.D"), "j-d");
        assert_eq!(sanitize_tag("dev box"), "dev-box");
        assert_eq!(sanitize_tag("rm_2"), "rm_2");
    }
}
