//! Access control evaluator (§4.3). CFEngine itself has no direct analogue
//! in the teacher repo, so the rule shape is built from scratch in its
//! idiom: a tagged enum dispatched on kind, matched against `regex` for the
//! pattern-based kinds, following the same "shared shape, tag-dispatched
//! semantics" design the teacher uses for `IoStream`/`LockMode`.

use regex::Regex;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    PathPrefix,
    PathExact,
    Literal,
    ClassPattern,
    Variable,
}

/// One access-control rule. `pattern` is interpreted per `kind`: a
/// filesystem path for `PathPrefix`/`PathExact`, a literal name for
/// `Literal`, and a regex source for `ClassPattern`/`Variable`.
#[derive(Debug, Clone)]
pub struct AclRule {
    pub kind: RuleKind,
    pub pattern: String,
    pub allow_addrs: Vec<String>,
    pub allow_regex: Vec<Regex>,
    pub deny_addrs: Vec<String>,
    pub deny_regex: Vec<Regex>,
    pub maproot_addrs: Vec<String>,
    pub maproot_regex: Vec<Regex>,
    pub requires_encrypt: bool,
    compiled_pattern: Option<Regex>,
}

impl AclRule {
    pub fn new(kind: RuleKind, pattern: &str) -> Result<Self, regex::Error> {
        let compiled_pattern = match kind {
            RuleKind::ClassPattern | RuleKind::Variable => {
                Some(Regex::new(&format!(r"\A(?:{})\z", pattern))?)
            }
            RuleKind::PathPrefix | RuleKind::PathExact | RuleKind::Literal => None,
        };
        Ok(Self {
            kind,
            pattern: pattern.to_string(),
            allow_addrs: Vec::new(),
            allow_regex: Vec::new(),
            deny_addrs: Vec::new(),
            deny_regex: Vec::new(),
            maproot_addrs: Vec::new(),
            maproot_regex: Vec::new(),
            requires_encrypt: false,
            compiled_pattern,
        })
    }

    fn matches_subject(&self, subject: &str) -> bool {
        match self.kind {
            RuleKind::PathPrefix => path_under_prefix(subject, &self.pattern),
            RuleKind::PathExact => self.pattern == "/" || subject == self.pattern,
            RuleKind::Literal => subject == self.pattern,
            RuleKind::ClassPattern | RuleKind::Variable => self
                .compiled_pattern
                .as_ref()
                .map(|re| re.is_match(subject))
                .unwrap_or(false),
        }
    }

    fn matches_identity(addrs: &[String], regexes: &[Regex], identity: &CallerIdentity) -> bool {
        let candidates = [
            Some(identity.ip.as_str()),
            identity.hostname.as_deref(),
            identity.username.as_deref(),
        ];
        for candidate in candidates.into_iter().flatten() {
            if addrs.iter().any(|a| a == candidate) {
                return true;
            }
            if regexes.iter().any(|re| re.is_match(candidate)) {
                return true;
            }
        }
        false
    }
}

/// Identity facts attached to the connection at the time of the request.
pub struct CallerIdentity {
    pub ip: String,
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub rsa_auth: bool,
}

pub struct Decision {
    pub grant: bool,
    pub map_root: bool,
}

/// Canonicalize a path subject: resolve symlinks in the parent directory,
/// leave the leaf component untouched, normalize separators. Falls back to
/// lexical normalization if the parent cannot be resolved (e.g. it doesn't
/// exist yet, which is not itself a reason to refuse — denial is an ACL
/// decision, not an I/O error).
pub fn normalize_path_subject(subject: &str) -> PathBuf {
    let raw = Path::new(subject);
    let (parent, leaf) = match (raw.parent(), raw.file_name()) {
        (Some(p), Some(l)) if !p.as_os_str().is_empty() => (p, Some(l)),
        _ => (raw, None),
    };

    let resolved_parent = parent.canonicalize().unwrap_or_else(|_| lexical_normalize(parent));

    match leaf {
        Some(l) => resolved_parent.join(l),
        None => resolved_parent,
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn path_under_prefix(subject: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    if subject == prefix {
        return true;
    }
    subject
        .strip_prefix(prefix)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Evaluate `admit`/`deny` lists against one request, per §4.3 steps 1-7.
pub fn evaluate(
    admit: &[AclRule],
    deny: &[AclRule],
    subject: &str,
    identity: &CallerIdentity,
    encrypted: bool,
) -> Decision {
    let mut grant = false;
    let mut map_root = false;

    for rule in admit {
        if !rule.matches_subject(subject) {
            continue;
        }
        if rule.requires_encrypt && !encrypted {
            grant = false;
            break;
        }
        if AclRule::matches_identity(&rule.maproot_addrs, &rule.maproot_regex, identity) {
            map_root = true;
        }
        if AclRule::matches_identity(&rule.allow_addrs, &rule.allow_regex, identity) {
            grant = true;
        }
        break;
    }

    for rule in deny {
        if !rule.matches_subject(subject) {
            continue;
        }
        if AclRule::matches_identity(&rule.deny_addrs, &rule.deny_regex, identity) {
            grant = false;
        }
    }

    if !identity.rsa_auth {
        map_root = false;
    }

    Decision { grant, map_root }
}

/// Role authorization for `EXEC --define`: every proposed class must be
/// granted by at least one role rule whose allow set matches the caller.
pub fn evaluate_roles(roles: &[AclRule], proposed_classes: &[String], identity: &CallerIdentity) -> bool {
    if proposed_classes.is_empty() {
        return true;
    }
    proposed_classes.iter().all(|class| {
        roles.iter().any(|rule| {
            rule.matches_subject(class)
                && AclRule::matches_identity(&rule.allow_addrs, &rule.allow_regex, identity)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(ip: &str) -> CallerIdentity {
        CallerIdentity {
            ip: ip.to_string(),
            hostname: None,
            username: None,
            rsa_auth: true,
        }
    }

    fn admit_rule(kind: RuleKind, pattern: &str, allow_ip: &str) -> AclRule {
        let mut r = AclRule::new(kind, pattern).unwrap();
        r.allow_addrs.push(allow_ip.to_string());
        r
    }

    #[test]
    fn path_prefix_requires_separator_boundary() {
        assert!(path_under_prefix("/var/cfengine/inputs/x", "/var/cfengine/inputs"));
        assert!(!path_under_prefix("/var/cfengine/inputs-extra/x", "/var/cfengine/inputs"));
        assert!(path_under_prefix("/var/cfengine/inputs", "/var/cfengine/inputs"));
    }

    #[test]
    fn root_path_always_matches() {
        assert!(path_under_prefix("/anything/at/all", "/"));
    }

    #[test]
    fn grant_requires_allow_match() {
        let admit = vec![admit_rule(RuleKind::PathPrefix, "/var/cfengine/inputs", "10.0.0.5")];
        let deny = vec![];
        let decision = evaluate(&admit, &deny, "/var/cfengine/inputs/promises.cf", &identity("10.0.0.5"), true);
        assert!(decision.grant);

        let decision2 = evaluate(&admit, &deny, "/var/cfengine/inputs/promises.cf", &identity("10.0.0.9"), true);
        assert!(!decision2.grant);
    }

    #[test]
    fn deny_overrides_admit() {
        let admit = vec![admit_rule(RuleKind::PathPrefix, "/var/cfengine/inputs", "10.0.0.5")];
        let mut deny_rule = AclRule::new(RuleKind::PathPrefix, "/var/cfengine/inputs").unwrap();
        deny_rule.deny_addrs.push("10.0.0.5".to_string());
        let decision = evaluate(&admit, &[deny_rule], "/var/cfengine/inputs/x", &identity("10.0.0.5"), true);
        assert!(!decision.grant);
    }

    #[test]
    fn requires_encrypt_blocks_plaintext() {
        let mut rule = admit_rule(RuleKind::PathPrefix, "/secret", "10.0.0.5");
        rule.requires_encrypt = true;
        let decision = evaluate(&[rule], &[], "/secret/x", &identity("10.0.0.5"), false);
        assert!(!decision.grant);
    }

    #[test]
    fn maproot_forced_off_without_rsa_auth() {
        let mut rule = admit_rule(RuleKind::PathPrefix, "/var/cfengine/inputs", "10.0.0.5");
        rule.maproot_addrs.push("10.0.0.5".to_string());
        let mut ident = identity("10.0.0.5");
        ident.rsa_auth = false;
        let decision = evaluate(&[rule], &[], "/var/cfengine/inputs/x", &ident, true);
        assert!(!decision.map_root);
    }

    #[test]
    fn maproot_set_when_rsa_auth_present() {
        let mut rule = admit_rule(RuleKind::PathPrefix, "/var/cfengine/inputs", "10.0.0.5");
        rule.maproot_addrs.push("10.0.0.5".to_string());
        let decision = evaluate(&[rule], &[], "/var/cfengine/inputs/x", &identity("10.0.0.5"), true);
        assert!(decision.map_root);
    }

    #[test]
    fn class_pattern_full_match_only() {
        let rule = admit_rule(RuleKind::ClassPattern, "^linux_.*$", "10.0.0.5");
        let decision = evaluate(&[rule], &[], "linux_x86_64", &identity("10.0.0.5"), true);
        assert!(decision.grant);
    }

    #[test]
    fn class_pattern_rejects_unanchored_substring_match() {
        let rule = admit_rule(RuleKind::ClassPattern, "update", "10.0.0.5");
        let decision = evaluate(&[rule], &[], "update_now", &identity("10.0.0.5"), true);
        assert!(!decision.grant);
    }

    #[test]
    fn role_authorization_requires_every_class_granted() {
        let role = admit_rule(RuleKind::Variable, "^update$", "alice");
        let ident = CallerIdentity {
            ip: "10.0.0.5".to_string(),
            hostname: None,
            username: Some("alice".to_string()),
            rsa_auth: true,
        };
        assert!(evaluate_roles(&[role.clone()], &["update".to_string()], &ident));
        assert!(!evaluate_roles(&[role], &["update".to_string(), "restart".to_string()], &ident));
    }
}
