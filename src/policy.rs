//! Declarative access-control policy, loaded once at startup (and again on
//! reload) from a TOML file. This is the external collaborator spec.md §1
//! assumes: the core never interprets a promise DSL, only this flat
//! projection of one.

use serde::Deserialize;
use std::path::Path;

use crate::acl::{AclRule, RuleKind};
use crate::error::{Result, ServerError};
use crate::state::ServerState;

#[derive(Debug, Deserialize, Default)]
pub struct PolicyFile {
    #[serde(default)]
    pub paths: Vec<PathRuleSpec>,
    #[serde(default)]
    pub vars: Vec<VarRuleSpec>,
    #[serde(default)]
    pub roles: Vec<RoleRuleSpec>,
    #[serde(default)]
    pub hosts: HostsSpec,
    #[serde(default)]
    pub run: RunSpec,
}

fn default_kind_path_prefix() -> String {
    "path_prefix".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PathRuleSpec {
    #[serde(default = "default_kind_path_prefix")]
    pub kind: String,
    pub pattern: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub maproot: Vec<String>,
    #[serde(default)]
    pub requires_encrypt: bool,
}

#[derive(Debug, Deserialize)]
pub struct VarRuleSpec {
    pub pattern: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub requires_encrypt: bool,
}

#[derive(Debug, Deserialize)]
pub struct RoleRuleSpec {
    pub pattern: String,
    #[serde(default)]
    pub allow: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct HostsSpec {
    #[serde(default)]
    pub attackers: Vec<String>,
    #[serde(default)]
    pub non_attackers: Vec<String>,
    #[serde(default)]
    pub multi_conn: Vec<String>,
    #[serde(default)]
    pub allow_users: Vec<String>,
    #[serde(default)]
    pub trust_keys: Vec<String>,
    #[serde(default)]
    pub skip_verify: Vec<String>,
    #[serde(default)]
    pub allow_legacy: Vec<String>,
}

fn default_cf_run_command() -> String {
    String::new()
}

#[derive(Debug, Deserialize)]
pub struct RunSpec {
    #[serde(default = "default_cf_run_command")]
    pub cf_run_command: String,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub cipher_preference: Option<String>,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            cf_run_command: default_cf_run_command(),
            max_workers: None,
            cipher_preference: None,
        }
    }
}

impl PolicyFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Resource(format!("read policy {}: {}", path.display(), e)))?;
        toml::from_str(&text)
            .map_err(|e| ServerError::Resource(format!("parse policy {}: {}", path.display(), e)))
    }

    /// Project this file into the `ServerState` shape the dispatcher and
    /// ACL evaluator consume (spec.md §3).
    pub fn into_server_state(self) -> Result<ServerState> {
        let mut admit_paths = Vec::new();
        let mut deny_paths = Vec::new();
        for spec in &self.paths {
            let kind = parse_path_kind(&spec.kind)?;
            let mut rule = AclRule::new(kind, &spec.pattern)
                .map_err(|e| ServerError::Resource(format!("invalid path pattern '{}': {}", spec.pattern, e)))?;
            rule.allow_addrs = spec.allow.clone();
            rule.maproot_addrs = spec.maproot.clone();
            rule.requires_encrypt = spec.requires_encrypt;
            admit_paths.push(rule.clone());
            if !spec.deny.is_empty() {
                let mut deny_rule = rule;
                deny_rule.deny_addrs = spec.deny.clone();
                deny_paths.push(deny_rule);
            }
        }

        let mut admit_vars = Vec::new();
        let mut deny_vars = Vec::new();
        for spec in &self.vars {
            let mut rule = AclRule::new(RuleKind::ClassPattern, &spec.pattern)
                .map_err(|e| ServerError::Resource(format!("invalid var pattern '{}': {}", spec.pattern, e)))?;
            rule.allow_addrs = spec.allow.clone();
            rule.requires_encrypt = spec.requires_encrypt;
            admit_vars.push(rule.clone());
            if !spec.deny.is_empty() {
                let mut deny_rule = rule;
                deny_rule.deny_addrs = spec.deny.clone();
                deny_vars.push(deny_rule);
            }
        }

        let mut roles = Vec::new();
        for spec in &self.roles {
            let mut rule = AclRule::new(RuleKind::Variable, &spec.pattern)
                .map_err(|e| ServerError::Resource(format!("invalid role pattern '{}': {}", spec.pattern, e)))?;
            rule.allow_addrs = spec.allow.clone();
            roles.push(rule);
        }

        Ok(ServerState::new(
            admit_paths,
            deny_paths,
            admit_vars,
            deny_vars,
            roles,
            self.hosts,
            self.run,
        ))
    }
}

fn parse_path_kind(s: &str) -> Result<RuleKind> {
    match s {
        "path_prefix" => Ok(RuleKind::PathPrefix),
        "path_exact" => Ok(RuleKind::PathExact),
        "literal" => Ok(RuleKind::Literal),
        other => Err(ServerError::Resource(format!("unknown path rule kind '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_policy() {
        let toml_src = r#"
            [[paths]]
            pattern = "/var/cfengine/inputs"
            allow = ["10.0.0.5"]

            [hosts]
            allow_users = ["alice"]

            [run]
            cf_run_command = "/var/cfengine/bin/cf-agent -K"
        "#;
        let file: PolicyFile = toml::from_str(toml_src).unwrap();
        assert_eq!(file.paths.len(), 1);
        assert_eq!(file.hosts.allow_users, vec!["alice".to_string()]);
        let state = file.into_server_state().unwrap();
        assert_eq!(state.admit_paths.len(), 1);
    }

    #[test]
    fn rejects_unknown_path_kind() {
        let toml_src = r#"
            [[paths]]
            kind = "bogus"
            pattern = "/x"
        "#;
        let file: PolicyFile = toml::from_str(toml_src).unwrap();
        assert!(file.into_server_state().is_err());
    }
}
