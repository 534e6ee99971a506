//! Access Control Lists
//!
//! An [`AclItem`] is one role's privilege grant on a resource; an [`AclList`] is the
//! full grant state of a resource, unique by role.
//!
//! # Text Forms
//! - Native (as reported by the server): `role=codes/grantor`, e.g. `miriam=arwdDxtm/miriam`.
//!   An empty role denotes `PUBLIC`; a `*` after a code marks the grant option.
//! - Human: `role:PRIV,PRIV`, e.g. `"report users":SELECT,INSERT`.
//!   The role may be double-quoted; privilege names are case-insensitive.
//!
//! # JSON Forms
//! Lists serialize as an array of `{"role", "privileges", "grantor"?}` objects and
//! deserialize from either that shape or an array of native/human strings.

use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::AdminError;

pub mod reconcile;

/// Canonical name of the pseudo-role every role belongs to
pub const PUBLIC: &str = "PUBLIC";

/// Sentinel privilege meaning "every privilege the object type has"
pub const ALL: &str = "ALL";

/// Suffix distinguishing a privilege held with grant option
pub const GRANT_OPTION: &str = " WITH GRANT OPTION";

/// Native single-character privilege codes
const PRIVILEGE_CODES: &[(char, &str)] = &[
    ('r', "SELECT"),
    ('w', "UPDATE"),
    ('a', "INSERT"),
    ('d', "DELETE"),
    ('D', "TRUNCATE"),
    ('x', "REFERENCES"),
    ('t', "TRIGGER"),
    ('C', "CREATE"),
    ('c', "CONNECT"),
    ('T', "TEMPORARY"),
    ('X', "EXECUTE"),
    ('U', "USAGE"),
    ('s', "SET"),
    ('A', "ALTER SYSTEM"),
    ('m', "MAINTAIN"),
];

/// ACL parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AclError {
    #[error("invalid ACL format: {0}")]
    InvalidFormat(String),
}

impl AclError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidFormat(message.into())
    }
}

impl From<AclError> for AdminError {
    fn from(err: AclError) -> Self {
        Self::BadParameter(err.to_string())
    }
}

/// Strip the grant-option suffix: `("SELECT", true)` for `SELECT WITH GRANT OPTION`
#[must_use]
pub fn split_grant_option(privilege: &str) -> (&str, bool) {
    match privilege.strip_suffix(GRANT_OPTION) {
        Some(base) => (base, true),
        None => (privilege, false),
    }
}

/// Normalize one human privilege token to its canonical name
fn normalize_privilege(token: &str) -> Result<String, AclError> {
    let upper = token.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    let (base, grant_option) = split_grant_option(&upper);

    let canonical = match base {
        "ALL" | "ALL PRIVILEGES" => ALL,
        "TEMP" => "TEMPORARY",
        other => PRIVILEGE_CODES
            .iter()
            .map(|(_, name)| *name)
            .find(|name| *name == other)
            .ok_or_else(|| AclError::invalid(format!("unknown privilege '{}'", token.trim())))?,
    };

    if grant_option {
        Ok(format!("{canonical}{GRANT_OPTION}"))
    } else {
        Ok(canonical.to_string())
    }
}

fn privilege_code(privilege: &str) -> Option<char> {
    PRIVILEGE_CODES.iter().find(|(_, name)| *name == privilege).map(|(code, _)| *code)
}

/// `public` in any case is the `PUBLIC` pseudo-role
fn canonical_role(role: &str) -> String {
    if role.eq_ignore_ascii_case("public") {
        PUBLIC.to_string()
    } else {
        role.to_string()
    }
}

/// Split `s` at the first unquoted `sep`, unquoting a leading `"..."` role
fn split_role(s: &str, sep: char) -> Option<(String, &str)> {
    let Some(quoted) = s.strip_prefix('"') else {
        return s.split_once(sep).map(|(role, rest)| (role.trim().to_string(), rest));
    };

    let mut role = String::new();
    let mut chars = quoted.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '"' {
            role.push(c);
            continue;
        }
        if matches!(chars.peek(), Some((_, '"'))) {
            role.push('"');
            chars.next();
            continue;
        }
        return quoted[i + 1..].trim_start().strip_prefix(sep).map(|rest| (role, rest));
    }
    None
}

fn needs_quotes(role: &str) -> bool {
    role.chars().any(|c| c.is_whitespace() || matches!(c, ':' | ',' | '=' | '/' | '"'))
}

fn quote_role(role: &str) -> String {
    format!("\"{}\"", role.replace('"', "\"\""))
}

/// Add `privilege` unless already held; `X WITH GRANT OPTION` absorbs a plain `X`
fn dedup_push(privileges: &mut Vec<String>, privilege: String) {
    let (base, grant_option) = split_grant_option(&privilege);
    let base = base.to_string();

    if grant_option {
        if let Some(plain) = privileges.iter_mut().find(|p| **p == base) {
            *plain = privilege;
            return;
        }
    } else if privileges.iter().any(|p| split_grant_option(p) == (base.as_str(), true)) {
        return;
    }

    if !privileges.contains(&privilege) {
        privileges.push(privilege);
    }
}

/// One role's privileges on a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclItem {
    role: String,
    privileges: Vec<String>,
    grantor: String,
}

impl AclItem {
    /// Build an item from a role and privilege names (validated, deduplicated)
    pub fn new<I, S>(role: &str, privileges: I) -> Result<Self, AclError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let role = canonical_role(role.trim());
        if role.is_empty() {
            return Err(AclError::invalid("empty role"));
        }

        let mut normalized = Vec::new();
        for token in privileges {
            let token = token.as_ref();
            if token.trim().is_empty() {
                continue;
            }
            dedup_push(&mut normalized, normalize_privilege(token)?);
        }
        if normalized.is_empty() {
            return Err(AclError::invalid(format!("empty privilege list for role '{role}'")));
        }

        Ok(Self { role, privileges: normalized, grantor: String::new() })
    }

    /// Parse the native `role=codes/grantor` form
    pub fn parse_native(s: &str) -> Result<Self, AclError> {
        let (role, rest) =
            split_role(s, '=').ok_or_else(|| AclError::invalid(format!("missing '=' in '{s}'")))?;
        let role = if role.is_empty() { PUBLIC.to_string() } else { canonical_role(&role) };

        let (codes, grantor) = rest.split_once('/').unwrap_or((rest, ""));
        if codes.is_empty() {
            return Err(AclError::invalid(format!("no privilege codes in '{s}'")));
        }

        let mut privileges = Vec::new();
        let mut chars = codes.chars().peekable();
        while let Some(code) = chars.next() {
            let name = PRIVILEGE_CODES
                .iter()
                .find(|(c, _)| *c == code)
                .map(|(_, name)| *name)
                .ok_or_else(|| {
                    AclError::invalid(format!("unknown privilege code '{code}' in '{s}'"))
                })?;
            if chars.next_if_eq(&'*').is_some() {
                dedup_push(&mut privileges, format!("{name}{GRANT_OPTION}"));
            } else {
                dedup_push(&mut privileges, name.to_string());
            }
        }

        let grantor = match grantor.strip_prefix('"').and_then(|g| g.strip_suffix('"')) {
            Some(quoted) => quoted.replace("\"\"", "\""),
            None => grantor.to_string(),
        };

        Ok(Self { role, privileges, grantor })
    }

    /// Parse the human `role:PRIV,PRIV` form
    pub fn parse_human(s: &str) -> Result<Self, AclError> {
        let (role, privileges) =
            split_role(s, ':').ok_or_else(|| AclError::invalid(format!("missing ':' in '{s}'")))?;
        Self::new(&role, privileges.split(','))
    }

    /// Role name (`PUBLIC` for the pseudo-role)
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Privileges in insertion order
    #[must_use]
    pub fn privileges(&self) -> &[String] {
        &self.privileges
    }

    /// Role that granted the privileges (empty when unknown)
    #[must_use]
    pub fn grantor(&self) -> &str {
        &self.grantor
    }

    /// True when the item grants every privilege
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.privileges.iter().any(|p| p == ALL)
    }

    /// True when both items hold the same privileges, in any order
    #[must_use]
    pub fn same_privileges(&self, other: &AclItem) -> bool {
        self.privileges.len() == other.privileges.len()
            && self.privileges.iter().all(|p| other.privileges.contains(p))
    }

    /// A copy of this item holding `privileges` instead
    #[must_use]
    pub fn with_privileges<I: IntoIterator<Item = String>>(&self, privileges: I) -> Self {
        let mut replaced = Vec::new();
        for privilege in privileges {
            dedup_push(&mut replaced, privilege);
        }
        Self { role: self.role.clone(), privileges: replaced, grantor: self.grantor.clone() }
    }

    /// Human form, quoting the role when needed
    pub fn format(&self) -> Result<String, AclError> {
        if self.role.is_empty() {
            return Err(AclError::invalid("empty role"));
        }
        let role = if needs_quotes(&self.role) { quote_role(&self.role) } else { self.role.clone() };
        Ok(format!("{role}:{}", self.privileges.join(",")))
    }

    /// Native form; `ALL` has no native code and is rejected
    pub fn to_native(&self) -> Result<String, AclError> {
        let mut codes = String::new();
        for privilege in &self.privileges {
            let (base, grant_option) = split_grant_option(privilege);
            let code = privilege_code(base).ok_or_else(|| {
                AclError::invalid(format!("privilege '{privilege}' has no native code"))
            })?;
            codes.push(code);
            if grant_option {
                codes.push('*');
            }
        }

        let role = match self.role.as_str() {
            PUBLIC => String::new(),
            role if needs_quotes(role) => quote_role(role),
            role => role.to_string(),
        };

        if self.grantor.is_empty() {
            Ok(format!("{role}={codes}"))
        } else if needs_quotes(&self.grantor) {
            Ok(format!("{role}={codes}/{}", quote_role(&self.grantor)))
        } else {
            Ok(format!("{role}={codes}/{}", self.grantor))
        }
    }

    /// Union of both privilege sets, first-seen order, keeping this item's grantor
    fn merge(&mut self, other: AclItem) {
        for privilege in other.privileges {
            dedup_push(&mut self.privileges, privilege);
        }
    }
}

impl FromStr for AclItem {
    type Err = AclError;

    /// Native form when an unquoted `=` separates the role, human form otherwise
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if split_role(s, '=').is_some() {
            Self::parse_native(s)
        } else {
            Self::parse_human(s)
        }
    }
}

impl fmt::Display for AclItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format().map_err(|_| fmt::Error)?)
    }
}

impl Serialize for AclItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = if self.grantor.is_empty() { 2 } else { 3 };
        let mut state = serializer.serialize_struct("AclItem", fields)?;
        state.serialize_field("role", &self.role)?;
        state.serialize_field("privileges", &self.privileges)?;
        if !self.grantor.is_empty() {
            state.serialize_field("grantor", &self.grantor)?;
        }
        state.end()
    }
}

/// Accepted JSON shapes for one ACL entry
#[derive(Deserialize)]
#[serde(untagged)]
enum AclEntry {
    Text(String),
    Object {
        role: String,
        privileges: Vec<String>,
        #[serde(default)]
        grantor: Option<String>,
    },
}

impl<'de> Deserialize<'de> for AclItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let item = match AclEntry::deserialize(deserializer)? {
            AclEntry::Text(text) => text.parse::<AclItem>(),
            AclEntry::Object { role, privileges, grantor } => {
                AclItem::new(&role, &privileges).map(|mut item| {
                    item.grantor = grantor.unwrap_or_default();
                    item
                })
            }
        };
        item.map_err(serde::de::Error::custom)
    }
}

/// A resource's grants, unique by role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclList(Vec<AclItem>);

impl AclList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `item`, merging privileges into an existing entry for the same role
    pub fn push(&mut self, item: AclItem) {
        match self.0.iter_mut().find(|existing| existing.role == item.role) {
            Some(existing) => existing.merge(item),
            None => self.0.push(item),
        }
    }

    /// Linear lookup by role (`public` matches `PUBLIC`)
    #[must_use]
    pub fn find(&self, role: &str) -> Option<&AclItem> {
        let role = canonical_role(role);
        self.0.iter().find(|item| item.role == role)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AclItem> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse native entries as reported by the server (one entry per grantor)
    pub fn from_native<S: AsRef<str>>(entries: &[S]) -> Result<Self, AclError> {
        entries.iter().map(|entry| AclItem::parse_native(entry.as_ref())).collect()
    }

    /// Native grant strings, one per role
    pub fn to_native(&self) -> Result<Vec<String>, AclError> {
        self.0.iter().map(AclItem::to_native).collect()
    }
}

impl FromIterator<AclItem> for AclList {
    fn from_iter<I: IntoIterator<Item = AclItem>>(iter: I) -> Self {
        let mut list = Self::new();
        list.extend(iter);
        list
    }
}

impl Extend<AclItem> for AclList {
    fn extend<I: IntoIterator<Item = AclItem>>(&mut self, iter: I) {
        for item in iter {
            self.push(item);
        }
    }
}

impl<'a> IntoIterator for &'a AclList {
    type Item = &'a AclItem;
    type IntoIter = std::slice::Iter<'a, AclItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for AclList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(&self.0)
    }
}

impl<'de> Deserialize<'de> for AclList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Vec::<AclItem>::deserialize(deserializer)?.into_iter().collect())
    }
}
