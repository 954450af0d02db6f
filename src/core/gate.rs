//! Purpose: Request-level access gate: transport security and HTTP Basic authentication.
//! Exports: `Transport`, `Environment`, `TransportPolicy`, `BasicAuth`, `parse_basic_credentials`.
//! Role: Runs before any export logic; HTTP-framework agnostic so the CLI and tests share it.
//! Invariants: The HTTPS override is honored only in the `dev` environment.
//! Invariants: Authentication failures never reveal which half of the credentials was wrong.
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::core::error::{Error, ErrorKind};
use crate::core::identity::{Identity, MemberStore};

pub const ENV_DISABLE_HTTPS: &str = "DISABLE_SEARCH_DATA_EXTRACTOR_HTTPS";
pub const DEFAULT_REALM: &str = "Search Data Extractor API";

pub const INSECURE_TRANSPORT_MESSAGE: &str = "Please use https";
pub const ENTER_CREDENTIALS_MESSAGE: &str = "Please enter a username and password.";
pub const UNRECOGNISED_MESSAGE: &str = "That username / password isn't recognised";
pub const NOT_PERMITTED_MESSAGE: &str = "That user is not an administrator.";

/// How the request reached the server.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Transport {
    #[default]
    Plain,
    Tls,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Environment {
    Dev,
    Test,
    Live,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportPolicy {
    https_override: bool,
    trust_forwarded_proto: bool,
}

impl TransportPolicy {
    /// Build the policy; `https_override` is discarded outside `dev`.
    pub fn new(environment: Environment, https_override: bool, trust_forwarded_proto: bool) -> Self {
        let https_override = https_override && environment == Environment::Dev;
        Self {
            https_override,
            trust_forwarded_proto,
        }
    }

    pub fn https_override(&self) -> bool {
        self.https_override
    }

    pub fn check(&self, transport: Transport, forwarded_proto: Option<&str>) -> Result<(), Error> {
        if self.https_override || self.is_secure(transport, forwarded_proto) {
            return Ok(());
        }
        Err(Error::new(ErrorKind::InsecureTransport).with_message(INSECURE_TRANSPORT_MESSAGE))
    }

    fn is_secure(&self, transport: Transport, forwarded_proto: Option<&str>) -> bool {
        if transport == Transport::Tls {
            return true;
        }
        if !self.trust_forwarded_proto {
            return false;
        }
        forwarded_proto
            .and_then(|value| value.split(',').next())
            .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
    }
}

/// Truthy spellings accepted for environment flags.
pub fn env_flag_is_set(value: Option<&str>) -> bool {
    value.is_some_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        )
    })
}

#[derive(Clone, Debug)]
pub struct BasicAuth {
    realm: String,
    permission_code: String,
    members: Arc<MemberStore>,
}

impl BasicAuth {
    pub fn new(
        realm: impl Into<String>,
        permission_code: impl Into<String>,
        members: Arc<MemberStore>,
    ) -> Self {
        Self {
            realm: realm.into(),
            permission_code: permission_code.into(),
            members,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn permission_code(&self) -> &str {
        &self.permission_code
    }

    /// Value for the `WWW-Authenticate` header sent with every 401.
    pub fn challenge(&self) -> String {
        format!("Basic realm=\"{}\"", self.realm.replace('"', "'"))
    }

    pub fn authenticate(&self, authorization: Option<&str>) -> Result<Identity, Error> {
        let Some((username, password)) = authorization.and_then(parse_basic_credentials) else {
            return Err(unauthenticated(ENTER_CREDENTIALS_MESSAGE));
        };
        let Some(identity) = self.members.verify(&username, &password) else {
            return Err(unauthenticated(UNRECOGNISED_MESSAGE));
        };
        if !identity.has_permission(&self.permission_code) {
            return Err(unauthenticated(NOT_PERMITTED_MESSAGE));
        }
        Ok(identity)
    }
}

fn unauthenticated(message: &str) -> Error {
    Error::new(ErrorKind::Unauthenticated).with_message(message)
}

/// Decode an `Authorization: Basic ...` header into username and password.
pub fn parse_basic_credentials(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    if username.is_empty() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}
