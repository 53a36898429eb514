//! Policy evaluation: first matching rule wins.
//!
//! Matching is pure except for public-key indirection, which may consult the
//! key directory (and therefore the network) when a principal pins its keys
//! behind an `https://` URL.

use std::collections::HashMap;

use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;

use super::keys::KeyResolver;
use super::{ConnInfo, SshAction, SshPolicy, SshPrincipal, SshRule};

/// Why a rule did not match. Consumed by tests only; callers of
/// [`eval_policy`] see a plain no-match and clients only ever see
/// "access denied".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchFailure {
    NoAction,
    Expired,
    UserMismatch,
    PrincipalMismatch,
}

/// Evaluate `pol` for `ci`, returning the action and resolved local user of
/// the first matching rule.
pub async fn eval_policy(
    pol: &SshPolicy,
    ci: &ConnInfo,
    keys: &dyn KeyResolver,
) -> Option<(SshAction, String)> {
    for rule in &pol.rules {
        if let Ok(matched) = match_rule(rule, ci, keys).await {
            return Some(matched);
        }
    }
    None
}

pub(crate) async fn match_rule(
    rule: &SshRule,
    ci: &ConnInfo,
    keys: &dyn KeyResolver,
) -> Result<(SshAction, String), MatchFailure> {
    let action = rule.action.as_ref().ok_or(MatchFailure::NoAction)?;
    if rule_expired(rule, ci) {
        return Err(MatchFailure::Expired);
    }

    // A pure reject with no user mapping applies to any requested name;
    // everything else must map the requested user to a local account.
    let mut local_user = String::new();
    if !(action.reject && rule.ssh_users.is_empty()) {
        local_user = map_local_user(&rule.ssh_users, &ci.ssh_user);
        if local_user.is_empty() {
            return Err(MatchFailure::UserMismatch);
        }
    }

    if !any_principal_matches(&rule.principals, ci, keys).await {
        return Err(MatchFailure::PrincipalMismatch);
    }
    Ok((action.clone(), local_user))
}

pub(crate) fn rule_expired(rule: &SshRule, ci: &ConnInfo) -> bool {
    match rule.rule_expires {
        Some(expiry) => expiry < ci.now,
        None => false,
    }
}

/// Resolve the requested SSH user through a rule's user map. The specific
/// entry wins over the `*` fallback; the value `=` maps the requested name
/// to itself. Empty result means no match.
pub(crate) fn map_local_user(users: &HashMap<String, String>, requested: &str) -> String {
    let v = users
        .get(requested)
        .or_else(|| users.get("*"))
        .cloned()
        .unwrap_or_default();
    if v == "=" {
        requested.to_string()
    } else {
        v
    }
}

async fn any_principal_matches(
    principals: &[SshPrincipal],
    ci: &ConnInfo,
    keys: &dyn KeyResolver,
) -> bool {
    for p in principals {
        if principal_matches_identity(p, ci) && principal_matches_pub_key(p, ci, keys).await {
            return true;
        }
    }
    false
}

/// Identity half of a principal: any-of node stable id, source address, or
/// owning login. Key constraints are not considered here.
pub(crate) fn principal_matches_identity(p: &SshPrincipal, ci: &ConnInfo) -> bool {
    if p.any {
        return true;
    }
    if !p.node.is_empty() && p.node == ci.node.stable_id {
        return true;
    }
    if !p.node_ip.is_empty() {
        if let Ok(ip) = p.node_ip.parse::<std::net::IpAddr>() {
            if ip == ci.src.ip() {
                return true;
            }
        }
    }
    if !p.user_login.is_empty() && p.user_login == ci.user_profile.login_name {
        return true;
    }
    false
}

async fn principal_matches_pub_key(
    p: &SshPrincipal,
    ci: &ConnInfo,
    keys: &dyn KeyResolver,
) -> bool {
    if p.pub_keys.is_empty() {
        return true;
    }
    let Some(client_key) = ci.pub_key.as_ref() else {
        return false;
    };

    // A single https:// entry is an indirection to the real list; anything
    // else is taken as literal authorized-keys lines.
    let fetched;
    let lines: &[String] = if p.pub_keys.len() == 1 && p.pub_keys[0].starts_with("https://") {
        match keys.resolve(&p.pub_keys[0]).await {
            Ok(lines) => {
                fetched = lines;
                &fetched
            }
            Err(_) => return false,
        }
    } else {
        &p.pub_keys
    };

    lines
        .iter()
        .any(|line| pub_key_matches_authorized_key(client_key, line))
}

/// Compare the client's key against one `type base64 [comment]` line: the
/// key type must agree and the wire marshaling must be byte-equal.
fn pub_key_matches_authorized_key(client: &PublicKey, line: &str) -> bool {
    let mut fields = line.split_whitespace();
    let (Some(want_type), Some(want_b64)) = (fields.next(), fields.next()) else {
        return false;
    };
    if client.name() != want_type {
        return false;
    }
    let Ok(want_blob) = base64::engine::general_purpose::STANDARD.decode(want_b64) else {
        return false;
    };
    !want_blob.is_empty() && client.public_key_bytes() == want_blob
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use russh_keys::key::KeyPair;

    use super::*;
    use crate::mesh::{MeshNode, UserProfile};

    struct StaticKeys(Vec<String>);

    #[async_trait]
    impl KeyResolver for StaticKeys {
        async fn resolve(&self, _url: &str) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct NoKeys;

    #[async_trait]
    impl KeyResolver for NoKeys {
        async fn resolve(&self, url: &str) -> Result<Vec<String>> {
            panic!("unexpected key fetch for {url}");
        }
    }

    fn conn_info(ssh_user: &str) -> ConnInfo {
        ConnInfo {
            now: Utc::now(),
            ssh_user: ssh_user.to_string(),
            src: "100.64.0.2:38822".parse::<SocketAddr>().unwrap(),
            dst: "100.64.0.1:22".parse::<SocketAddr>().unwrap(),
            node: MeshNode { id: 7, stable_id: "nSTABLE".into(), name: "peer".into() },
            user_profile: UserProfile {
                login_name: "alice@example.com".into(),
                display_name: "Alice".into(),
            },
            pub_key: None,
        }
    }

    fn accept_rule(users: &[(&str, &str)], principal: SshPrincipal) -> SshRule {
        SshRule {
            rule_expires: None,
            principals: vec![principal],
            ssh_users: users
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            action: Some(SshAction { accept: true, ..Default::default() }),
        }
    }

    fn any_principal() -> SshPrincipal {
        SshPrincipal { any: true, ..Default::default() }
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let pol = SshPolicy {
            rules: vec![
                accept_rule(&[("bob", "=")], any_principal()),
                SshRule {
                    action: Some(SshAction { reject: true, ..Default::default() }),
                    principals: vec![any_principal()],
                    ..Default::default()
                },
                accept_rule(&[("alice", "=")], any_principal()),
            ],
        };
        let (action, user) = eval_policy(&pol, &conn_info("alice"), &NoKeys).await.unwrap();
        // The pure reject precedes the accept and matches any user.
        assert!(action.reject);
        assert_eq!(user, "");
    }

    #[tokio::test]
    async fn expired_rule_never_matches() {
        let mut rule = accept_rule(&[("alice", "=")], any_principal());
        rule.rule_expires = Some(Utc::now() - ChronoDuration::seconds(1));
        let err = match_rule(&rule, &conn_info("alice"), &NoKeys).await.unwrap_err();
        assert_eq!(err, MatchFailure::Expired);
        assert!(eval_policy(&SshPolicy { rules: vec![rule] }, &conn_info("alice"), &NoKeys)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn rule_without_action_is_skipped() {
        let rule = SshRule { principals: vec![any_principal()], ..Default::default() };
        let err = match_rule(&rule, &conn_info("alice"), &NoKeys).await.unwrap_err();
        assert_eq!(err, MatchFailure::NoAction);
    }

    #[test]
    fn user_map_specific_beats_wildcard() {
        let users: HashMap<String, String> = [("alice", "ops"), ("*", "guest")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(map_local_user(&users, "alice"), "ops");
        assert_eq!(map_local_user(&users, "bob"), "guest");
    }

    #[test]
    fn user_map_identity_value() {
        let users: HashMap<String, String> =
            [("*".to_string(), "=".to_string())].into_iter().collect();
        assert_eq!(map_local_user(&users, "carol"), "carol");
        assert_eq!(map_local_user(&HashMap::new(), "carol"), "");
    }

    #[tokio::test]
    async fn empty_user_map_only_matches_pure_reject() {
        let accept = SshRule {
            principals: vec![any_principal()],
            action: Some(SshAction { accept: true, ..Default::default() }),
            ..Default::default()
        };
        let err = match_rule(&accept, &conn_info("alice"), &NoKeys).await.unwrap_err();
        assert_eq!(err, MatchFailure::UserMismatch);

        let reject = SshRule {
            principals: vec![any_principal()],
            action: Some(SshAction { reject: true, ..Default::default() }),
            ..Default::default()
        };
        let (action, user) = match_rule(&reject, &conn_info("alice"), &NoKeys).await.unwrap();
        assert!(action.reject);
        assert_eq!(user, "");
    }

    #[tokio::test]
    async fn identity_predicates() {
        let ci = conn_info("alice");
        assert!(principal_matches_identity(&any_principal(), &ci));
        assert!(principal_matches_identity(
            &SshPrincipal { node: "nSTABLE".into(), ..Default::default() },
            &ci
        ));
        assert!(principal_matches_identity(
            &SshPrincipal { node_ip: "100.64.0.2".into(), ..Default::default() },
            &ci
        ));
        assert!(principal_matches_identity(
            &SshPrincipal { user_login: "alice@example.com".into(), ..Default::default() },
            &ci
        ));
        assert!(!principal_matches_identity(
            &SshPrincipal { user_login: "mallory@example.com".into(), ..Default::default() },
            &ci
        ));
        assert!(!principal_matches_identity(&SshPrincipal::default(), &ci));
    }

    #[tokio::test]
    async fn key_constraint_requires_presented_key() {
        let pair = KeyPair::generate_ed25519();
        let pubkey = pair.clone_public_key().unwrap();
        let line = format!("{} {} test-key", pubkey.name(), pubkey.public_key_base64());

        let principal = SshPrincipal {
            user_login: "alice@example.com".into(),
            pub_keys: vec![line.clone()],
            ..Default::default()
        };
        let rule = accept_rule(&[("alice", "=")], principal);

        // No key presented (the "none" probe): principal cannot match.
        let err = match_rule(&rule, &conn_info("alice"), &NoKeys).await.unwrap_err();
        assert_eq!(err, MatchFailure::PrincipalMismatch);

        // Matching key presented.
        let mut ci = conn_info("alice");
        ci.pub_key = Some(pubkey);
        assert!(match_rule(&rule, &ci, &NoKeys).await.is_ok());

        // Wrong key presented.
        let other = KeyPair::generate_ed25519().clone_public_key().unwrap();
        ci.pub_key = Some(other);
        let err = match_rule(&rule, &ci, &NoKeys).await.unwrap_err();
        assert_eq!(err, MatchFailure::PrincipalMismatch);
    }

    #[tokio::test]
    async fn single_url_key_list_resolves_through_directory() {
        let pair = KeyPair::generate_ed25519();
        let pubkey = pair.clone_public_key().unwrap();
        let line = format!("{} {}", pubkey.name(), pubkey.public_key_base64());

        let principal = SshPrincipal {
            any: true,
            pub_keys: vec!["https://keys.example.com/alice.keys".into()],
            ..Default::default()
        };
        let rule = accept_rule(&[("alice", "=")], principal);

        let mut ci = conn_info("alice");
        ci.pub_key = Some(pubkey);
        assert!(match_rule(&rule, &ci, &StaticKeys(vec![line])).await.is_ok());

        // Two entries are literals even if one looks like a URL.
        let mixed = SshPrincipal {
            any: true,
            pub_keys: vec!["https://keys.example.com/alice.keys".into(), "junk".into()],
            ..Default::default()
        };
        let rule = accept_rule(&[("alice", "=")], mixed);
        let err = match_rule(&rule, &ci, &NoKeys).await.unwrap_err();
        assert_eq!(err, MatchFailure::PrincipalMismatch);
    }

    #[test]
    fn authorized_key_line_parsing() {
        let pair = KeyPair::generate_ed25519();
        let pubkey = pair.clone_public_key().unwrap();
        let b64 = pubkey.public_key_base64();

        assert!(pub_key_matches_authorized_key(&pubkey, &format!("ssh-ed25519 {b64}")));
        assert!(pub_key_matches_authorized_key(
            &pubkey,
            &format!("ssh-ed25519 {b64} user@host")
        ));
        // Type prefix must agree.
        assert!(!pub_key_matches_authorized_key(&pubkey, &format!("ssh-rsa {b64}")));
        // Garbage never matches.
        assert!(!pub_key_matches_authorized_key(&pubkey, "ssh-ed25519"));
        assert!(!pub_key_matches_authorized_key(&pubkey, "ssh-ed25519 !!!not-base64!!!"));
    }
}
