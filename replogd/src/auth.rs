//! Authorization
//!
//! Every client call is checked as `(subject, object, action)` against an
//! [`Authorizer`]. The object is always `"*"`: there's a single log.
use std::{fmt, fs, path::Path};

use tracing::debug;

use crate::config::{ConfigError, ConfigResult};

pub const WILDCARD: &str = "*";

/// Everything a client (or a peer) can ask for
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    Produce,
    Consume,
    Join,
    Leave,
    Replicate,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Produce => "produce",
            Action::Consume => "consume",
            Action::Join => "join",
            Action::Leave => "leave",
            Action::Replicate => "replicate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether `subject` may do `action` on `object`
pub trait Authorizer: Send + Sync + fmt::Debug {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> bool;
}

/// Permits everything, for setups without an ACL
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _subject: &str, _object: &str, _action: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PolicyRule {
    subject: String,
    object: String,
    action: String,
}

fn field_matches(rule: &str, value: &str) -> bool {
    rule == WILDCARD || rule == value
}

impl PolicyRule {
    fn matches(&self, subject: &str, object: &str, action: &str) -> bool {
        field_matches(&self.subject, subject)
            && field_matches(&self.object, object)
            && field_matches(&self.action, action)
    }
}

/// Allow-list loaded from a casbin style `policy.csv`
///
/// Only `p, subject, object, action` lines are supported, with `*`
/// matching anything. Whatever is not explicitly allowed is denied.
#[derive(Debug, Clone, Default)]
pub struct PolicyAuthorizer {
    rules: Vec<PolicyRule>,
}

impl PolicyAuthorizer {
    /// Load the policy; the model file must be present, but only the
    /// matcher described above is implemented
    pub fn load(model_file: &Path, policy_file: &Path) -> ConfigResult<Self> {
        fs::metadata(model_file).map_err(|e| ConfigError::io(model_file, e))?;
        let content =
            fs::read_to_string(policy_file).map_err(|e| ConfigError::io(policy_file, e))?;
        let s = Self::parse(&content).map_err(|(line, msg)| ConfigError::Policy {
            path: policy_file.to_owned(),
            line,
            msg,
        })?;
        debug!(rules = s.rules.len(), "ACL policy loaded");
        Ok(s)
    }

    /// Parse policy lines; errors carry the 1-based line number
    fn parse(content: &str) -> Result<Self, (usize, String)> {
        let mut rules = vec![];
        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<_> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                ["p", subject, object, action] => rules.push(PolicyRule {
                    subject: (*subject).to_owned(),
                    object: (*object).to_owned(),
                    action: (*action).to_owned(),
                }),
                _ => return Err((i + 1, format!("unsupported rule: {line}"))),
            }
        }
        Ok(Self { rules })
    }
}

impl Authorizer for PolicyAuthorizer {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.matches(subject, object, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = "
# root can do anything
p, root, *, produce
p, root, *, consume
p, root, *, join
p, root, *, leave
p, root, *, replicate

p, *, *, consume
";

    #[test]
    fn policy_allows_listed_actions_only() -> anyhow::Result<()> {
        let acl = PolicyAuthorizer::parse(POLICY).map_err(|(line, msg)| anyhow::anyhow!("{line}: {msg}"))?;

        for action in [
            Action::Produce,
            Action::Consume,
            Action::Join,
            Action::Leave,
            Action::Replicate,
        ] {
            assert!(acl.authorize("root", WILDCARD, action.as_str()));
        }
        assert!(acl.authorize("nobody", WILDCARD, "consume"));
        assert!(acl.authorize("", WILDCARD, "consume"));
        assert!(!acl.authorize("nobody", WILDCARD, "produce"));
        assert!(!acl.authorize("nobody", WILDCARD, "replicate"));
        Ok(())
    }

    #[test]
    fn empty_policy_denies() {
        let acl = PolicyAuthorizer::default();
        assert!(!acl.authorize("root", WILDCARD, "produce"));
        assert!(AllowAll.authorize("root", WILDCARD, "produce"));
    }

    #[test]
    fn invalid_line_is_reported() {
        let err = PolicyAuthorizer::parse("p, root, *, produce\ng, root, admin\n").unwrap_err();
        assert_eq!(err.0, 2);
    }

    #[test]
    fn load_from_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let model = dir.path().join("model.conf");
        let policy = dir.path().join("policy.csv");

        assert!(matches!(
            PolicyAuthorizer::load(&model, &policy),
            Err(ConfigError::Io { .. })
        ));

        fs::write(&model, "[matchers]\nm = r.sub == p.sub && r.obj == p.obj && r.act == p.act\n")?;
        fs::write(&policy, "p, root, *, produce\n")?;
        let acl = PolicyAuthorizer::load(&model, &policy)?;
        assert!(acl.authorize("root", WILDCARD, "produce"));
        assert!(!acl.authorize("root", WILDCARD, "consume"));
        Ok(())
    }
}
