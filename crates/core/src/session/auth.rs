//! RTSP authentication (RFC 2617 as profiled by RFC 2326 §D.2).
//!
//! Only `DESCRIBE` is challenged. The server prefers Digest and falls back
//! to Basic when configured:
//!
//! ```text
//! WWW-Authenticate: Digest realm="<realm>",nonce="<32 random chars>"
//! WWW-Authenticate: Basic realm="<realm>"
//! ```
//!
//! Digest responses are checked as
//! `MD5(HA1:nonce:MD5(METHOD:uri))` with `HA1 = MD5(user:realm:password)`,
//! or `HA1` taken verbatim when the password lookup returned a hash.

use std::collections::HashMap;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::error::{Result, RtspError};
use crate::hooks::Password;

use super::random_token;

/// Length of the server-issued Digest nonce.
pub const NONCE_LEN: usize = 32;

/// Parsed `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Basic { user: String, password: String },
    Digest(DigestCredentials),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

impl Authorization {
    pub fn parse(header: &str) -> Result<Self> {
        let (scheme, params) = header
            .trim()
            .split_once(' ')
            .ok_or_else(|| RtspError::AuthFailed("can not find auth type or auth string".into()))?;
        match scheme {
            "Basic" => {
                let decoded = BASE64_STANDARD
                    .decode(params.trim())
                    .map_err(|e| RtspError::AuthFailed(format!("bad basic credentials: {e}")))?;
                let decoded = String::from_utf8_lossy(&decoded);
                let (user, password) = decoded.split_once(':').ok_or_else(|| {
                    RtspError::AuthFailed("can not find user and password in basic auth".into())
                })?;
                Ok(Self::Basic {
                    user: user.to_string(),
                    password: password.to_string(),
                })
            }
            "Digest" => Ok(Self::Digest(DigestCredentials::parse(params))),
            other => Err(RtspError::AuthFailed(format!("unsupported auth type: {other}"))),
        }
    }
}

impl DigestCredentials {
    /// Parse `k="v", k=v, ...`; unknown keys are ignored.
    pub fn parse(params: &str) -> Self {
        let map: HashMap<&str, &str> = params
            .split(',')
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.trim_matches([' ', '"']), v.trim_matches([' ', '"'])))
            .collect();
        let get = |k: &str| map.get(k).map(|v| v.to_string()).unwrap_or_default();
        Self {
            username: get("username"),
            realm: get("realm"),
            nonce: get("nonce"),
            uri: get("uri"),
            response: get("response"),
        }
    }

    /// Check realm, nonce and presence of the hashed fields before asking
    /// for a password.
    pub fn precheck(&self, realm: &str, nonce: &str) -> Result<()> {
        if self.realm != realm {
            return Err(RtspError::AuthFailed(format!(
                "realm not matched: {realm} != {}",
                self.realm
            )));
        }
        if self.nonce != nonce {
            return Err(RtspError::AuthFailed(format!(
                "nonce not matched: {} != {nonce}",
                self.nonce
            )));
        }
        if self.username.is_empty() || self.uri.is_empty() || self.response.is_empty() {
            return Err(RtspError::AuthFailed("username/uri/response empty".into()));
        }
        Ok(())
    }

    pub fn verify(&self, method: &str, password: &Password) -> bool {
        let ha1 = match password {
            Password::Plain(p) => md5_hex(&format!("{}:{}:{}", self.username, self.realm, p)),
            Password::Md5(h) => h.to_ascii_lowercase(),
        };
        let expected = digest_response(&ha1, &self.nonce, method, &self.uri);
        expected.eq_ignore_ascii_case(&self.response)
    }
}

/// Basic auth check. A hashed password is compared against the
/// `MD5(user:realm:password)` of what the client sent.
pub fn verify_basic(user: &str, realm: &str, given: &str, password: &Password) -> bool {
    match password {
        Password::Plain(p) => p == given,
        Password::Md5(h) => md5_hex(&format!("{user}:{realm}:{given}")).eq_ignore_ascii_case(h),
    }
}

pub fn digest_response(ha1: &str, nonce: &str, method: &str, uri: &str) -> String {
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

pub fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

pub fn new_nonce() -> String {
    random_token(NONCE_LEN)
}

/// `WWW-Authenticate` value: Digest when a nonce is given, else Basic.
pub fn challenge(realm: &str, nonce: Option<&str>) -> String {
    match nonce {
        Some(nonce) => format!("Digest realm=\"{realm}\",nonce=\"{nonce}\""),
        None => format!("Basic realm=\"{realm}\""),
    }
}
