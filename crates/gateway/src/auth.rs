use std::net::IpAddr;

use {
    secrecy::{ExposeSecret, Secret},
    subtle::ConstantTimeEq,
};

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Bearer token required from every caller.
    Token,
    /// No token configured: only loopback callers are admitted.
    LoopbackOnly,
}

/// Resolved admin API auth configuration.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    token: Option<Secret<String>>,
}

/// Result of an authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub ok: bool,
    pub method: Option<AuthMethod>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Token,
    Loopback,
}

impl AuthResult {
    fn allowed(method: AuthMethod) -> Self {
        Self {
            ok: true,
            method: Some(method),
            reason: None,
        }
    }

    fn denied(reason: &str) -> Self {
        Self {
            ok: false,
            method: None,
            reason: Some(reason.into()),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison.
fn safe_equal(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

pub fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        },
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

// ── Auth logic ───────────────────────────────────────────────────────────────

/// Resolve admin auth from the configured token. Empty tokens count as unset.
pub fn resolve_auth(token: Option<String>) -> ResolvedAuth {
    match token.filter(|t| !t.is_empty()) {
        Some(token) => ResolvedAuth {
            mode: AuthMode::Token,
            token: Some(Secret::new(token)),
        },
        None => ResolvedAuth {
            mode: AuthMode::LoopbackOnly,
            token: None,
        },
    }
}

/// Authenticate an admin API request.
pub fn authorize_admin(
    auth: &ResolvedAuth,
    provided_token: Option<&str>,
    remote_ip: IpAddr,
) -> AuthResult {
    match auth.mode {
        AuthMode::Token => {
            let Some(expected) = auth.token.as_ref() else {
                return AuthResult::denied("token_missing_config");
            };
            let Some(given) = provided_token else {
                return AuthResult::denied("token_missing");
            };
            if !safe_equal(given, expected.expose_secret()) {
                return AuthResult::denied("token_mismatch");
            }
            AuthResult::allowed(AuthMethod::Token)
        },
        AuthMode::LoopbackOnly => {
            if is_loopback(remote_ip) {
                AuthResult::allowed(AuthMethod::Loopback)
            } else {
                AuthResult::denied("not_loopback")
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback(ip("127.0.0.1")));
        assert!(is_loopback(ip("127.1.2.3")));
        assert!(is_loopback(ip("::1")));
        assert!(is_loopback(ip("::ffff:127.0.0.1")));
        assert!(!is_loopback(ip("10.0.0.1")));
        assert!(!is_loopback(ip("::ffff:10.0.0.1")));
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }

    #[test]
    fn token_mode_checks_token_from_anywhere() {
        let auth = resolve_auth(Some("admin-t".into()));
        assert_eq!(auth.mode, AuthMode::Token);
        assert!(authorize_admin(&auth, Some("admin-t"), ip("10.0.0.1")).ok);
        let denied = authorize_admin(&auth, Some("admin-x"), ip("127.0.0.1"));
        assert!(!denied.ok);
        assert_eq!(denied.reason.as_deref(), Some("token_mismatch"));
        assert_eq!(
            authorize_admin(&auth, None, ip("127.0.0.1")).reason.as_deref(),
            Some("token_missing")
        );
    }

    #[test]
    fn no_token_means_loopback_only() {
        let auth = resolve_auth(Some(String::new()));
        assert_eq!(auth.mode, AuthMode::LoopbackOnly);
        let ok = authorize_admin(&auth, None, ip("127.0.0.1"));
        assert_eq!(ok.method, Some(AuthMethod::Loopback));
        assert!(!authorize_admin(&auth, None, ip("192.168.1.5")).ok);
    }
}
