//! RTSP authentication (RFC 2326 §12.5, RFC 2617).
//!
//! A `401 Unauthorized` response carries one or more `WWW-Authenticate`
//! challenges. The client answers the first scheme it can satisfy by
//! re-sending the request with an `Authorization` header, then keeps the
//! credentials to sign every later request.
//!
//! | Scheme | Header value |
//! |--------|--------------|
//! | Basic  | `Basic base64(user:pass)` |
//! | Digest | `Digest username=.., realm=.., nonce=.., uri=.., response=..` |

use std::fmt;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use md5::{Digest, Md5};

use crate::protocol::{Header, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    Basic,
    Digest,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => f.write_str("Basic"),
            Self::Digest => f.write_str("Digest"),
        }
    }
}

/// One parsed `WWW-Authenticate` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: AuthScheme,
    params: Vec<(String, String)>,
}

impl Challenge {
    /// Parse `<scheme> k=v, k="v, with comma", ...`. Unknown schemes yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (scheme, rest) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
        let scheme = if scheme.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else if scheme.eq_ignore_ascii_case("digest") {
            AuthScheme::Digest
        } else {
            return None;
        };

        Some(Challenge {
            scheme,
            params: split_params(rest),
        })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Split a comma separated `key=value` list, honouring quoted strings.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    let mut flush = |raw: &str| {
        if let Some((key, value)) = raw.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                params.push((key.to_string(), value.trim().trim_matches('"').to_string()));
            }
        }
    };

    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                flush(&current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    flush(&current);
    params
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AuthInt => "auth-int",
        }
    }
}

/// State for answering Digest challenges, including the nonce count.
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    username: String,
    password: String,
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: Option<String>,
    qop: Option<Qop>,
    nonce_count: u32,
    last_nonce: Option<String>,
}

impl DigestCredentials {
    fn from_challenge(challenge: &Challenge, username: &str, password: &str) -> Self {
        // Prefer plain `auth` when the server offers both.
        let qop = challenge.param("qop").and_then(|offered| {
            let options: Vec<&str> = offered.split(',').map(str::trim).collect();
            if options.iter().any(|o| o.eq_ignore_ascii_case("auth")) {
                Some(Qop::Auth)
            } else if options.iter().any(|o| o.eq_ignore_ascii_case("auth-int")) {
                Some(Qop::AuthInt)
            } else {
                None
            }
        });

        DigestCredentials {
            username: username.to_string(),
            password: password.to_string(),
            realm: challenge.param("realm").unwrap_or_default().to_string(),
            nonce: challenge.param("nonce").unwrap_or_default().to_string(),
            opaque: challenge.param("opaque").map(str::to_string),
            algorithm: challenge.param("algorithm").map(str::to_string),
            qop,
            nonce_count: 0,
            last_nonce: None,
        }
    }

    fn authorization(&mut self, request: &Request) -> String {
        if self.last_nonce.as_deref() == Some(self.nonce.as_str()) {
            self.nonce_count += 1;
        } else {
            self.nonce_count = 1;
            self.last_nonce = Some(self.nonce.clone());
        }
        let cnonce = format!("{:08x}", rand::random::<u32>());
        self.authorization_with(request, &cnonce)
    }

    fn authorization_with(&self, request: &Request, cnonce: &str) -> String {
        let method = request.method.as_str();
        let uri = request.url.as_str();
        let nc = format!("{:08x}", self.nonce_count);

        let ha1 = md5_hex(&format!("{}:{}:{}", self.username, self.realm, self.password));
        let ha2 = match self.qop {
            Some(Qop::AuthInt) => {
                let body = request.body.as_ref().map(|b| b.content.as_str()).unwrap_or("");
                md5_hex(&format!("{}:{}:{}", method, uri, md5_hex(body)))
            }
            _ => md5_hex(&format!("{}:{}", method, uri)),
        };
        let response = match self.qop {
            Some(qop) => md5_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1,
                self.nonce,
                nc,
                cnonce,
                qop.as_str(),
                ha2
            )),
            None => md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
            self.username, self.realm, self.nonce, uri
        );
        if let Some(qop) = self.qop {
            header.push_str(&format!(
                ", qop={}, nc={}, cnonce=\"{}\"",
                qop.as_str(),
                nc,
                cnonce
            ));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        if let Some(algorithm) = &self.algorithm {
            header.push_str(&format!(", algorithm={}", algorithm));
        }
        header.push_str(&format!(", response=\"{}\"", response));
        header
    }
}

/// Credentials chosen in answer to a challenge.
#[derive(Debug, Clone)]
pub enum Credentials {
    Basic { username: String, password: String },
    Digest(DigestCredentials),
}

impl Credentials {
    pub fn from_challenge(challenge: &Challenge, username: &str, password: &str) -> Self {
        match challenge.scheme {
            AuthScheme::Basic => Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            },
            AuthScheme::Digest => {
                Credentials::Digest(DigestCredentials::from_challenge(challenge, username, password))
            }
        }
    }

    pub fn scheme(&self) -> AuthScheme {
        match self {
            Self::Basic { .. } => AuthScheme::Basic,
            Self::Digest(_) => AuthScheme::Digest,
        }
    }

    /// Set the `Authorization` header on `request`.
    pub fn apply(&mut self, request: &mut Request) {
        let value = match self {
            Self::Basic { username, password } => format!(
                "Basic {}",
                BASE64_STANDARD.encode(format!("{}:{}", username, password))
            ),
            Self::Digest(digest) => digest.authorization(request),
        };
        request.headers.insert(Header::Authorization, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Method;

    #[test]
    fn parse_digest_challenge_with_quoted_commas() {
        let challenge = Challenge::parse(
            "Digest realm=\"IP Camera, Front\", nonce=\"a1b2c3\", qop=\"auth,auth-int\", stale=FALSE",
        )
        .unwrap();
        assert_eq!(challenge.scheme, AuthScheme::Digest);
        assert_eq!(challenge.param("realm"), Some("IP Camera, Front"));
        assert_eq!(challenge.param("nonce"), Some("a1b2c3"));
        assert_eq!(challenge.param("qop"), Some("auth,auth-int"));
        assert_eq!(challenge.param("stale"), Some("FALSE"));
    }

    #[test]
    fn unknown_scheme_is_ignored() {
        assert!(Challenge::parse("Bearer realm=\"x\"").is_none());
    }

    #[test]
    fn basic_header() {
        let challenge = Challenge::parse("Basic realm=\"cam\"").unwrap();
        let mut credentials = Credentials::from_challenge(&challenge, "admin", "12345");
        let mut request = Request::new(Method::Describe, "rtsp://cam/live");
        credentials.apply(&mut request);
        assert_eq!(
            request.header(&Header::Authorization),
            Some("Basic YWRtaW46MTIzNDU=")
        );
    }

    #[test]
    fn digest_without_qop_matches_rfc2069_form() {
        let challenge =
            Challenge::parse("Digest realm=\"testrealm\", nonce=\"dcd98b7102dd2f0e\"").unwrap();
        let Credentials::Digest(mut digest) =
            Credentials::from_challenge(&challenge, "user", "pass")
        else {
            panic!("expected digest credentials");
        };
        digest.nonce_count = 1;
        let request = Request::new(Method::Describe, "rtsp://cam/live");
        let header = digest.authorization_with(&request, "unused");

        let ha1 = md5_hex("user:testrealm:pass");
        let ha2 = md5_hex("DESCRIBE:rtsp://cam/live");
        let expected = md5_hex(&format!("{}:dcd98b7102dd2f0e:{}", ha1, ha2));
        assert!(header.starts_with("Digest username=\"user\", realm=\"testrealm\""));
        assert!(header.ends_with(&format!("response=\"{}\"", expected)));
        assert!(!header.contains("qop="));
    }

    #[test]
    fn digest_with_qop_uses_nonce_count_and_cnonce() {
        let challenge = Challenge::parse(
            "Digest realm=\"r\", nonce=\"n\", qop=\"auth\", opaque=\"o\", algorithm=MD5",
        )
        .unwrap();
        let Credentials::Digest(mut digest) =
            Credentials::from_challenge(&challenge, "u", "p")
        else {
            panic!("expected digest credentials");
        };
        digest.nonce_count = 1;
        let request = Request::new(Method::Play, "rtsp://cam/live/");
        let header = digest.authorization_with(&request, "0a4f113b");

        let ha1 = md5_hex("u:r:p");
        let ha2 = md5_hex("PLAY:rtsp://cam/live/");
        let expected = md5_hex(&format!("{}:n:00000001:0a4f113b:auth:{}", ha1, ha2));
        assert!(header.contains("qop=auth, nc=00000001, cnonce=\"0a4f113b\""));
        assert!(header.contains("opaque=\"o\""));
        assert!(header.contains("algorithm=MD5"));
        assert!(header.ends_with(&format!("response=\"{}\"", expected)));
    }

    #[test]
    fn nonce_count_increments_while_nonce_is_reused() {
        let challenge = Challenge::parse("Digest realm=\"r\", nonce=\"n\", qop=auth").unwrap();
        let mut credentials = Credentials::from_challenge(&challenge, "u", "p");
        let mut first = Request::new(Method::Setup, "rtsp://cam/live/track1");
        let mut second = Request::new(Method::Play, "rtsp://cam/live/");
        credentials.apply(&mut first);
        credentials.apply(&mut second);
        assert!(first.header(&Header::Authorization).unwrap().contains("nc=00000001"));
        assert!(second.header(&Header::Authorization).unwrap().contains("nc=00000002"));
    }
}
