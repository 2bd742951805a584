//! HTTP authentication: Basic (RFC 7617) and Digest (RFC 7616, `qop="auth"`).

use crate::http::types::{Headers, Method};
use crate::options::{Authentication, AuthenticationMethod};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Outcome of the per-request authentication check.
#[derive(Debug, PartialEq)]
pub(crate) enum AuthOutcome {
    Authorized,
    /// Respond `401` with this `WWW-Authenticate` value; the connection
    /// stays open so the client can retry with credentials.
    Challenge(String),
}

pub(crate) struct Authenticator {
    method: AuthenticationMethod,
    realm: String,
    /// Precomputed `base64(user:pass)` tokens for Basic.
    basic_tokens: HashSet<String>,
    /// Precomputed HA1 = md5(user:realm:pass) per user for Digest.
    ha1: HashMap<String, String>,
    /// One server nonce per run. A valid digest over an older nonce is
    /// answered `stale=true` so the client re-sends without re-prompting.
    nonce: Mutex<String>,
}

impl Authenticator {
    pub(crate) fn new(config: &Authentication) -> Self {
        let basic_tokens = config
            .accounts
            .iter()
            .map(|(user, pass)| BASE64.encode(format!("{user}:{pass}")))
            .collect();
        let ha1 = config
            .accounts
            .iter()
            .map(|(user, pass)| {
                let digest = md5_hex(format!("{user}:{}:{pass}", config.realm).as_bytes());
                (user.clone(), digest)
            })
            .collect();

        Self {
            method: config.method,
            realm: config.realm.clone(),
            basic_tokens,
            ha1,
            nonce: Mutex::new(make_nonce()),
        }
    }

    pub(crate) fn check(&self, method: &Method, target: &str, headers: &Headers) -> AuthOutcome {
        match self.method {
            AuthenticationMethod::Basic => self.check_basic(headers),
            AuthenticationMethod::Digest => self.check_digest(method, target, headers),
        }
    }

    fn check_basic(&self, headers: &Headers) -> AuthOutcome {
        let token = headers
            .get("authorization")
            .and_then(|v| v.trim().strip_prefix("Basic "))
            .map(str::trim);

        match token {
            Some(token) if self.basic_tokens.contains(token) => AuthOutcome::Authorized,
            _ => AuthOutcome::Challenge(format!("Basic realm=\"{}\"", self.realm)),
        }
    }

    fn check_digest(&self, method: &Method, target: &str, headers: &Headers) -> AuthOutcome {
        let nonce = self.nonce.lock().expect("nonce mutex poisoned").clone();

        let Some(params) = headers
            .get("authorization")
            .and_then(|v| v.trim().strip_prefix("Digest "))
            .map(parse_digest_params)
        else {
            return self.digest_challenge(&nonce, false);
        };

        let (Some(username), Some(realm), Some(client_nonce_value), Some(uri), Some(response)) = (
            params.get("username"),
            params.get("realm"),
            params.get("nonce"),
            params.get("uri"),
            params.get("response"),
        ) else {
            return self.digest_challenge(&nonce, false);
        };

        if *realm != self.realm {
            return self.digest_challenge(&nonce, false);
        }
        let Some(ha1) = self.ha1.get(username.as_str()) else {
            return self.digest_challenge(&nonce, false);
        };

        // qop="auth" is the only mode offered, so nc and cnonce are required.
        let (Some(nc), Some(cnonce)) = (params.get("nc"), params.get("cnonce")) else {
            return self.digest_challenge(&nonce, false);
        };
        if params.get("qop").map(String::as_str) != Some("auth") {
            return self.digest_challenge(&nonce, false);
        }

        let ha2 = md5_hex(format!("{method}:{uri}").as_bytes());
        let expected = md5_hex(
            format!("{ha1}:{client_nonce_value}:{nc}:{cnonce}:auth:{ha2}").as_bytes(),
        );
        if expected != *response {
            return self.digest_challenge(&nonce, false);
        }

        // Correct credentials over a stale nonce: challenge once with
        // stale=true so the client retries against the current nonce.
        if *client_nonce_value != nonce {
            return self.digest_challenge(&nonce, true);
        }

        // the digested uri must address what the request line addressed
        if uri.as_str() != target {
            return self.digest_challenge(&nonce, false);
        }

        AuthOutcome::Authorized
    }

    fn digest_challenge(&self, nonce: &str, stale: bool) -> AuthOutcome {
        let mut challenge = format!(
            "Digest realm=\"{}\", nonce=\"{nonce}\", qop=\"auth\"",
            self.realm
        );
        if stale {
            challenge.push_str(", stale=true");
        }
        AuthOutcome::Challenge(challenge)
    }
}

fn make_nonce() -> String {
    let entropy: [u8; 16] = rand::random();
    BASE64.encode(entropy)
}

pub(crate) fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Parses `key="value", key=value, ...` respecting quoted strings.
fn parse_digest_params(src: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = src.trim();

    while !rest.is_empty() {
        let Some((key, after_key)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_lowercase();

        let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after_key.find(',') {
                Some(end) => (after_key[..end].trim(), &after_key[end..]),
                None => (after_key.trim(), ""),
            }
        };

        params.insert(key, value.to_string());
        rest = remainder.trim_start_matches([',', ' ']);
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(method: AuthenticationMethod) -> Authentication {
        Authentication {
            method,
            realm: "R".to_string(),
            accounts: HashMap::from([("u".to_string(), "p".to_string())]),
        }
    }

    fn headers_with_authorization(value: &str) -> Headers {
        let mut headers = Headers::new();
        headers.set("Authorization", value);
        headers
    }

    #[test]
    fn basic_accepts_valid_credentials() {
        let auth = Authenticator::new(&config(AuthenticationMethod::Basic));
        let headers = headers_with_authorization(&format!("Basic {}", BASE64.encode("u:p")));

        assert_eq!(
            auth.check(&Method::Get, "/", &headers),
            AuthOutcome::Authorized
        );
    }

    #[test]
    fn basic_challenges_bad_or_missing_credentials() {
        let auth = Authenticator::new(&config(AuthenticationMethod::Basic));

        #[rustfmt::skip]
        let cases = [
            Headers::new(),
            headers_with_authorization("Basic d3Jvbmc6Y3JlZHM="),
            headers_with_authorization("Bearer token"),
        ];

        for headers in cases {
            match auth.check(&Method::Get, "/", &headers) {
                AuthOutcome::Challenge(challenge) => {
                    assert_eq!(challenge, "Basic realm=\"R\"");
                }
                AuthOutcome::Authorized => panic!("must challenge"),
            }
        }
    }

    #[test]
    fn digest_round_trip() {
        let auth = Authenticator::new(&config(AuthenticationMethod::Digest));

        // First request carries no credentials and must be challenged.
        let AuthOutcome::Challenge(challenge) = auth.check(&Method::Get, "/x", &Headers::new())
        else {
            panic!("must challenge");
        };
        assert!(challenge.starts_with("Digest realm=\"R\", nonce=\""));
        assert!(challenge.contains("qop=\"auth\""));
        assert!(!challenge.contains("stale"));

        // Client computes the digest response over the served nonce.
        let nonce = challenge
            .split("nonce=\"")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap();
        let ha1 = md5_hex(b"u:R:p");
        let ha2 = md5_hex(b"GET:/x");
        let response = md5_hex(format!("{ha1}:{nonce}:00000001:abc123:auth:{ha2}").as_bytes());

        let headers = headers_with_authorization(&format!(
            "Digest username=\"u\", realm=\"R\", nonce=\"{nonce}\", uri=\"/x\", \
             qop=auth, nc=00000001, cnonce=\"abc123\", response=\"{response}\""
        ));

        assert_eq!(
            auth.check(&Method::Get, "/x", &headers),
            AuthOutcome::Authorized
        );
    }

    #[test]
    fn digest_stale_nonce_is_flagged() {
        let auth = Authenticator::new(&config(AuthenticationMethod::Digest));

        // Valid credentials computed over a nonce this server never issued.
        let old_nonce = "bm9uY2UtZnJvbS1sYXN0LXJ1bg==";
        let ha1 = md5_hex(b"u:R:p");
        let ha2 = md5_hex(b"GET:/x");
        let response = md5_hex(format!("{ha1}:{old_nonce}:00000001:c:auth:{ha2}").as_bytes());

        let headers = headers_with_authorization(&format!(
            "Digest username=\"u\", realm=\"R\", nonce=\"{old_nonce}\", uri=\"/x\", \
             qop=auth, nc=00000001, cnonce=\"c\", response=\"{response}\""
        ));

        match auth.check(&Method::Get, "/x", &headers) {
            AuthOutcome::Challenge(challenge) => assert!(challenge.ends_with("stale=true")),
            AuthOutcome::Authorized => panic!("stale nonce must re-challenge"),
        }
    }

    #[test]
    fn digest_wrong_password_challenges_without_stale() {
        let auth = Authenticator::new(&config(AuthenticationMethod::Digest));
        let AuthOutcome::Challenge(challenge) = auth.check(&Method::Get, "/x", &Headers::new())
        else {
            panic!("must challenge");
        };
        let nonce = challenge
            .split("nonce=\"")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap();

        let ha1 = md5_hex(b"u:R:wrong");
        let ha2 = md5_hex(b"GET:/x");
        let response = md5_hex(format!("{ha1}:{nonce}:00000001:c:auth:{ha2}").as_bytes());
        let headers = headers_with_authorization(&format!(
            "Digest username=\"u\", realm=\"R\", nonce=\"{nonce}\", uri=\"/x\", \
             qop=auth, nc=00000001, cnonce=\"c\", response=\"{response}\""
        ));

        match auth.check(&Method::Get, "/x", &headers) {
            AuthOutcome::Challenge(challenge) => assert!(!challenge.contains("stale")),
            AuthOutcome::Authorized => panic!("wrong password must challenge"),
        }
    }

    #[test]
    fn digest_param_parsing() {
        let params = parse_digest_params(
            "username=\"u\", realm=\"a, b\", nonce=\"n\", uri=\"/p\", qop=auth, nc=00000001",
        );

        assert_eq!(params["username"], "u");
        assert_eq!(params["realm"], "a, b"); // comma inside quotes survives
        assert_eq!(params["qop"], "auth");
        assert_eq!(params["nc"], "00000001");
    }

    #[test]
    fn md5_hex_vector() {
        // RFC 1321 test vector
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
