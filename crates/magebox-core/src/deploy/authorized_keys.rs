//! `authorized_keys` reconciliation.
//!
//! Lines written by the deployer end in a `magebox:<username>` comment token.
//! Everything else in the file belongs to someone else and is carried over
//! verbatim, in order. Keys are compared by `(type, base64 payload)` only.

use std::collections::HashSet;

/// Prefix of the ownership marker appended to managed lines.
pub const MARKER_PREFIX: &str = "magebox:";

/// A user's public key as it should appear on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserKey {
    pub username: String,
    /// OpenSSH public key line; any comment is replaced by the marker.
    pub public_key: String,
}

impl UserKey {
    pub fn new(username: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            public_key: public_key.into(),
        }
    }
}

/// Result of rebuilding a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDiff {
    pub content: String,
    pub added: usize,
    pub removed: usize,
}

impl KeyDiff {
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
#[must_use]
pub fn sanitize_username(username: &str) -> String {
    username
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The marker token for `username`.
#[must_use]
pub fn marker(username: &str) -> String {
    format!("{MARKER_PREFIX}{}", sanitize_username(username))
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-sha2-") || token.starts_with("sk-")
}

/// `(type, data)` of a key line, skipping any leading options field.
fn key_identity(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut tokens = line.split_whitespace();
    let key_type = tokens.by_ref().find(|t| is_key_type(t))?;
    let data = tokens.next()?;
    Some((key_type, data))
}

fn is_managed(line: &str) -> bool {
    line.split_whitespace()
        .skip(1)
        .any(|t| t.starts_with(MARKER_PREFIX))
}

fn owned_by(line: &str, marker: &str) -> bool {
    line.split_whitespace().skip(1).any(|t| t == marker)
}

/// Whether two key lines carry the same key, ignoring comments and options.
#[must_use]
pub fn keys_match(a: &str, b: &str) -> bool {
    match (key_identity(a), key_identity(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn managed_line(user: &UserKey) -> Option<(String, (String, String))> {
    let (key_type, data) = key_identity(&user.public_key)?;
    Some((
        format!("{key_type} {data} {}", marker(&user.username)),
        (key_type.to_owned(), data.to_owned()),
    ))
}

fn render(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Rebuild `current` so its managed section matches `users` exactly.
///
/// Unmanaged lines keep their order and come first; blank lines are
/// dropped. Users whose key cannot be parsed are skipped, and a key listed
/// twice is written once.
#[must_use]
pub fn build_authorized_keys(current: &str, users: &[UserKey]) -> KeyDiff {
    let mut unmanaged = Vec::new();
    let mut previous: HashSet<(String, String)> = HashSet::new();

    for line in current.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if is_managed(line) {
            if let Some((t, d)) = key_identity(line) {
                previous.insert((t.to_owned(), d.to_owned()));
            }
        } else {
            unmanaged.push(line.to_owned());
        }
    }

    let mut desired: HashSet<(String, String)> = HashSet::new();
    let mut lines = unmanaged;
    let mut added = 0;
    for user in users {
        let Some((line, identity)) = managed_line(user) else {
            continue;
        };
        if desired.contains(&identity) {
            continue;
        }
        if !previous.contains(&identity) {
            added += 1;
        }
        desired.insert(identity);
        lines.push(line);
    }

    let removed = previous.difference(&desired).count();

    KeyDiff {
        content: render(&lines),
        added,
        removed,
    }
}

/// Append `user`'s key unless a managed line with the same key exists.
#[must_use]
pub fn add_managed_key(current: &str, user: &UserKey) -> KeyDiff {
    let mut lines: Vec<String> = current
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_owned)
        .collect();

    let present = lines
        .iter()
        .any(|l| is_managed(l) && keys_match(l, &user.public_key));
    let added = match managed_line(user) {
        Some((line, _)) if !present => {
            lines.push(line);
            1
        }
        _ => 0,
    };

    KeyDiff {
        content: render(&lines),
        added,
        removed: 0,
    }
}

/// Drop every managed line owned by `username`.
#[must_use]
pub fn remove_managed_key(current: &str, username: &str) -> KeyDiff {
    let owner = marker(username);
    let mut removed = 0;
    let lines: Vec<String> = current
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter(|l| {
            let drop = owned_by(l, &owner);
            if drop {
                removed += 1;
            }
            !drop
        })
        .map(str::to_owned)
        .collect();

    KeyDiff {
        content: render(&lines),
        added: 0,
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAlice";
    const KEY_B: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBob";
    const UNMANAGED: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAAOps ops@bastion";

    #[test]
    fn sanitizes_usernames() {
        assert_eq!(sanitize_username("alice.smith-2_x"), "alice.smith-2_x");
        assert_eq!(sanitize_username("bob@example.com"), "bob_example.com");
        assert_eq!(sanitize_username("evil name\n"), "evil_name_");
        assert_eq!(marker("a b"), "magebox:a_b");
    }

    #[test]
    fn keys_match_ignores_comment() {
        assert!(keys_match(&format!("{KEY_A} one"), &format!("{KEY_A} magebox:two")));
        assert!(keys_match(&format!("no-pty {KEY_A}"), KEY_A));
        assert!(!keys_match(KEY_A, KEY_B));
        assert!(!keys_match(
            "ssh-ed25519 AAAA x",
            "ecdsa-sha2-nistp256 AAAA x"
        ));
        assert!(!keys_match("", KEY_A));
    }

    #[test]
    fn unchanged_when_desired_matches_current() {
        let current = format!("{UNMANAGED}\n{KEY_A} magebox:alice\n");
        let diff = build_authorized_keys(&current, &[UserKey::new("alice", KEY_A)]);
        assert_eq!(diff.added, 0);
        assert_eq!(diff.removed, 0);
        assert!(diff.is_unchanged());
        assert_eq!(diff.content, current);
    }

    #[test]
    fn replacing_user_adds_and_removes() {
        let current = format!("{UNMANAGED}\n{KEY_A} magebox:alice\n");
        let diff = build_authorized_keys(&current, &[UserKey::new("bob", KEY_B)]);
        assert_eq!(diff.added, 1);
        assert_eq!(diff.removed, 1);
        assert!(diff.content.contains(UNMANAGED));
        assert!(diff.content.contains(&format!("{KEY_B} magebox:bob")));
        assert!(!diff.content.contains("magebox:alice"));
    }

    #[test]
    fn relabelled_key_is_not_counted_as_added() {
        let current = format!("{KEY_A} magebox:old-name\n");
        let diff = build_authorized_keys(&current, &[UserKey::new("alice", KEY_A)]);
        assert_eq!((diff.added, diff.removed), (0, 0));
        assert_eq!(diff.content, format!("{KEY_A} magebox:alice\n"));
    }

    #[test]
    fn unmanaged_lines_keep_order_and_text() {
        let current = format!("# managed by ops\n\n{UNMANAGED}\ncommand=\"backup\" {KEY_B} backup\n");
        let diff = build_authorized_keys(&current, &[]);
        assert_eq!(
            diff.content,
            format!("# managed by ops\n{UNMANAGED}\ncommand=\"backup\" {KEY_B} backup\n")
        );
    }

    #[test]
    fn empty_result_is_empty_string() {
        let diff = build_authorized_keys(&format!("{KEY_A} magebox:alice\n"), &[]);
        assert_eq!(diff.content, "");
        assert_eq!(diff.removed, 1);
    }

    #[test]
    fn duplicate_and_unparseable_desired_keys() {
        let users = [
            UserKey::new("alice", KEY_A),
            UserKey::new("alice2", format!("{KEY_A} other comment")),
            UserKey::new("broken", "not a key"),
        ];
        let diff = build_authorized_keys("", &users);
        assert_eq!(diff.added, 1);
        assert_eq!(diff.content.lines().count(), 1);
    }

    #[test]
    fn add_is_idempotent() {
        let user = UserKey::new("alice", KEY_A);
        let first = add_managed_key(UNMANAGED, &user);
        assert_eq!(first.added, 1);
        assert_eq!(first.content, format!("{UNMANAGED}\n{KEY_A} magebox:alice\n"));

        let second = add_managed_key(&first.content, &user);
        assert_eq!(second.added, 0);
        assert_eq!(second.content, first.content);
    }

    #[test]
    fn remove_only_touches_owner() {
        let current = format!("{UNMANAGED}\n{KEY_A} magebox:alice\n{KEY_B} magebox:alice2\n");
        let diff = remove_managed_key(&current, "alice");
        assert_eq!(diff.removed, 1);
        assert_eq!(diff.content, format!("{UNMANAGED}\n{KEY_B} magebox:alice2\n"));

        let none = remove_managed_key(&diff.content, "carol");
        assert_eq!(none.removed, 0);
    }
}
