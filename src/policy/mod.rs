//! SSH access policy: the control-plane wire model.
//!
//! A policy is an ordered list of rules; the first matching rule decides the
//! connection. The JSON schema here is shared with the control plane, so
//! field names (including the historical `sesssionDuration` spelling) are
//! load-bearing.

pub mod keys;
pub mod matcher;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use russh_keys::key::PublicKey;
use serde::{Deserialize, Deserializer, Serialize};

use crate::mesh::{MeshNode, UserProfile};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Ordered SSH access rules for this node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SshPolicy {
    /// Rules in evaluation order. First match wins.
    #[serde(default, deserialize_with = "null_resistant")]
    pub rules: Vec<SshRule>,
}

/// One access rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SshRule {
    /// Expiry; a rule whose expiry precedes evaluation time never matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_expires: Option<DateTime<Utc>>,

    /// Who the rule applies to, disjunctively. An empty list matches nobody.
    #[serde(default, deserialize_with = "null_resistant")]
    pub principals: Vec<SshPrincipal>,

    /// Requested-SSH-user to local-user mapping. A value of `=` maps the
    /// requested name to itself; the key `*` is a fallback for any name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ssh_users: HashMap<String, String>,

    /// What to do on match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SshAction>,
}

/// An identity predicate plus an optional public-key constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SshPrincipal {
    /// Matches a node by stable id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,

    /// Matches a node by mesh address.
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "nodeIP")]
    pub node_ip: String,

    /// Matches every node owned by this mesh login.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_login: String,

    /// Matches every caller.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub any: bool,

    /// Acceptable client public keys: `type base64 [comment]` lines, or a
    /// single `https://` URL resolving to such lines. Empty means no key
    /// constraint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pub_keys: Vec<String>,
}

/// Decision attached to a rule, or fetched from a delegate URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SshAction {
    /// Shown to the client (stderr) before the action is applied.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reject: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub accept: bool,

    /// Maximum session lifetime; zero/absent means untimed. The wire
    /// spelling has three s's; the corrected spelling is accepted on decode.
    #[serde(
        rename = "sesssionDuration",
        alias = "sessionDuration",
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_nanos"
    )]
    pub session_duration: Option<Duration>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_agent_forwarding: bool,

    /// URL of a follow-up action on the control plane.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hold_and_delegate: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_local_port_forwarding: bool,

    /// Recording-policy hint: `true` forces transcript recording for the
    /// session, `false` suppresses it, absent defers to the server knob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<bool>,
}

/// The three meaningful states of an [`SshAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind<'a> {
    Accept,
    Reject,
    Hold(&'a str),
    /// None of accept/reject/delegate set; always treated as an error.
    Invalid,
}

impl SshAction {
    /// Classify the action. `reject` dominates, then `accept`, then the
    /// delegate URL.
    pub fn kind(&self) -> ActionKind<'_> {
        if self.reject {
            ActionKind::Reject
        } else if self.accept {
            ActionKind::Accept
        } else if !self.hold_and_delegate.is_empty() {
            ActionKind::Hold(&self.hold_and_delegate)
        } else {
            ActionKind::Invalid
        }
    }

    /// Whether this action lets the connection proceed (terminally or via
    /// delegation). Used by the auth callbacks and by revalidation.
    pub fn allows_connection(&self) -> bool {
        matches!(self.kind(), ActionKind::Accept | ActionKind::Hold(_))
    }
}

// ---------------------------------------------------------------------------
// Connection info
// ---------------------------------------------------------------------------

/// Everything the matcher may consult about a connection. Built once at
/// accept time and never mutated.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    /// Evaluation time, fixed for the lifetime of the connection attempt.
    pub now: DateTime<Utc>,
    /// Requested SSH user ("root", "alice", ...).
    pub ssh_user: String,
    /// Mesh source of the connection.
    pub src: SocketAddr,
    /// Mesh destination the connection arrived on.
    pub dst: SocketAddr,
    /// Resolved source node.
    pub node: MeshNode,
    /// The node owner's profile.
    pub user_profile: UserProfile,
    /// Public key presented by the client, unset during the "none"
    /// authentication probe.
    pub pub_key: Option<PublicKey>,
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// Deserialize an array that may contain JSON `null` entries, skipping them.
fn null_resistant<'de, D, T>(de: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let items: Vec<Option<T>> = Vec::deserialize(de)?;
    Ok(items.into_iter().flatten().collect())
}

/// Durations travel as integer nanoseconds (the control plane's encoding).
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_u64(d.as_nanos() as u64),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let nanos: Option<i64> = Option::deserialize(de)?;
        Ok(nanos.and_then(|n| {
            if n <= 0 {
                None
            } else {
                Some(Duration::from_nanos(n as u64))
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_json_round_trip_is_identity() {
        let a = SshAction {
            message: "welcome\n".into(),
            accept: true,
            session_duration: Some(Duration::from_secs(90)),
            allow_agent_forwarding: true,
            allow_local_port_forwarding: true,
            ..Default::default()
        };
        let encoded = serde_json::to_string(&a).unwrap();
        let decoded: SshAction = serde_json::from_str(&encoded).unwrap();
        assert_eq!(a, decoded);
    }

    #[test]
    fn session_duration_wire_spelling() {
        let a = SshAction {
            accept: true,
            session_duration: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let encoded = serde_json::to_string(&a).unwrap();
        assert!(encoded.contains("\"sesssionDuration\":1000000000"), "{encoded}");

        // Both spellings decode.
        let legacy: SshAction =
            serde_json::from_str(r#"{"accept":true,"sesssionDuration":2000000000}"#).unwrap();
        let corrected: SshAction =
            serde_json::from_str(r#"{"accept":true,"sessionDuration":2000000000}"#).unwrap();
        assert_eq!(legacy.session_duration, Some(Duration::from_secs(2)));
        assert_eq!(corrected.session_duration, Some(Duration::from_secs(2)));
    }

    #[test]
    fn zero_duration_means_untimed() {
        let a: SshAction =
            serde_json::from_str(r#"{"accept":true,"sesssionDuration":0}"#).unwrap();
        assert_eq!(a.session_duration, None);
    }

    #[test]
    fn null_rules_and_principals_are_skipped() {
        let p: SshPolicy = serde_json::from_str(
            r#"{"rules":[null,{"principals":[null,{"any":true}],"sshUsers":{"*":"="},"action":{"accept":true}},null]}"#,
        )
        .unwrap();
        assert_eq!(p.rules.len(), 1);
        assert_eq!(p.rules[0].principals.len(), 1);
        assert!(p.rules[0].principals[0].any);
    }

    #[test]
    fn action_kind_precedence() {
        let reject = SshAction { reject: true, accept: true, ..Default::default() };
        assert_eq!(reject.kind(), ActionKind::Reject);

        let hold = SshAction { hold_and_delegate: "https://c/x".into(), ..Default::default() };
        assert_eq!(hold.kind(), ActionKind::Hold("https://c/x"));
        assert!(hold.allows_connection());

        assert_eq!(SshAction::default().kind(), ActionKind::Invalid);
        assert!(!SshAction::default().allows_connection());
    }

    #[test]
    fn policy_round_trip() {
        let p = SshPolicy {
            rules: vec![SshRule {
                rule_expires: None,
                principals: vec![SshPrincipal { user_login: "a@b".into(), ..Default::default() }],
                ssh_users: HashMap::from([("alice".to_string(), "=".to_string())]),
                action: Some(SshAction { accept: true, ..Default::default() }),
            }],
        };
        let encoded = serde_json::to_string(&p).unwrap();
        let decoded: SshPolicy = serde_json::from_str(&encoded).unwrap();
        assert_eq!(p, decoded);
    }
}
