//! Purpose: Identities, stored members and credential verification.
//! Exports: `Identity`, `Member`, `MemberStore`, `hash_password`, `generate_salt`, `PERMISSIONS`.
//! Role: Minimal identity provider backing HTTP Basic authentication.
//! Invariants: Passwords are stored only as hex(SHA-256(salt || password)).
//! Invariants: The `ADMIN` permission code implies every other code.
use std::collections::{BTreeMap, BTreeSet};

use getrandom::fill as fill_random;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind};

pub const API_PERMISSION_CODE: &str = "SEARCH_DATA_EXTRACTOR_ACCESS";
pub const ADMIN_PERMISSION_CODE: &str = "ADMIN";

/// Permission codes this service defines, with operator-facing descriptions.
pub const PERMISSIONS: &[(&str, &str)] = &[(
    API_PERMISSION_CODE,
    "Ability to access the Search Data Extractor API",
)];

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Identity {
    pub username: String,
    pub permissions: BTreeSet<String>,
    pub groups: BTreeSet<String>,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn with_permission(mut self, code: impl Into<String>) -> Self {
        self.permissions.insert(code.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn is_admin(&self) -> bool {
        self.permissions.contains(ADMIN_PERMISSION_CODE)
    }

    pub fn has_permission(&self, code: &str) -> bool {
        self.is_admin() || self.permissions.contains(code)
    }

    pub fn in_any_group<'a>(&self, groups: impl IntoIterator<Item = &'a str>) -> bool {
        groups.into_iter().any(|group| self.groups.contains(group))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Member {
    pub username: String,
    pub salt: String,
    pub password_sha256: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Member {
    pub fn identity(&self) -> Identity {
        Identity {
            username: self.username.clone(),
            permissions: self.permissions.iter().cloned().collect(),
            groups: self.groups.iter().cloned().collect(),
        }
    }

    fn password_matches(&self, password: &str) -> bool {
        let candidate = hash_password(&self.salt, password);
        constant_time_eq(
            candidate.as_bytes(),
            self.password_sha256.to_ascii_lowercase().as_bytes(),
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemberStore {
    members: BTreeMap<String, Member>,
}

impl MemberStore {
    pub fn new(members: Vec<Member>) -> Result<Self, Error> {
        let mut map = BTreeMap::new();
        for member in members {
            if member.username.is_empty() {
                return Err(Error::new(ErrorKind::Corrupt).with_message("member username is empty"));
            }
            if map.contains_key(&member.username) {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!("duplicate member {}", member.username)));
            }
            map.insert(member.username.clone(), member);
        }
        Ok(Self { members: map })
    }

    pub fn get(&self, username: &str) -> Option<&Member> {
        self.members.get(username)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Identity for a username/password pair, or `None` when either is wrong.
    pub fn verify(&self, username: &str, password: &str) -> Option<Identity> {
        let member = self.members.get(username)?;
        member
            .password_matches(password)
            .then(|| member.identity())
    }
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex_encode(&hasher.finalize())
}

pub fn generate_salt() -> Result<String, Error> {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("failed to generate salt: {err}"))
    })?;
    Ok(hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(nibble_hex(byte >> 4));
        out.push(nibble_hex(byte & 0x0f));
    }
    out
}

fn nibble_hex(nibble: u8) -> char {
    match nibble {
        0..=9 => char::from(b'0' + nibble),
        _ => char::from(b'a' + (nibble - 10)),
    }
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
