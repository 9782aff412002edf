//! Identity propagation
//!
//! Authentication itself is an external collaborator; the router only
//! carries identity forward. Whatever the auth layer established is
//! read from the session cookie and request headers, and appended to
//! proxied requests as `X-Ploinky-*` headers.

use axum::http::HeaderMap;

pub const SSO_COOKIE: &str = "ploinky_sso";

pub const USER_ID_HEADER: &str = "x-ploinky-user-id";
pub const USER_HEADER: &str = "x-ploinky-user";
pub const USER_EMAIL_HEADER: &str = "x-ploinky-user-email";
pub const USER_ROLES_HEADER: &str = "x-ploinky-user-roles";
pub const SESSION_ID_HEADER: &str = "x-ploinky-session-id";

/// Identity attached to one request.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: Option<String>,
    pub user: Option<String>,
    pub email: Option<String>,
    /// Role names, propagated as CSV
    pub roles: Vec<String>,
    pub session_id: Option<String>,
    pub access_token: Option<String>,
}

impl Identity {
    /// Extract identity from request headers and the SSO cookie.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };

        let roles = header(USER_ROLES_HEADER)
            .map(|csv| {
                csv.split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let access_token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.to_string());

        Self {
            user_id: header(USER_ID_HEADER),
            user: header(USER_HEADER),
            email: header(USER_EMAIL_HEADER),
            roles,
            session_id: cookie_value(headers, SSO_COOKIE),
            access_token,
        }
    }

    /// Append propagation headers to an outgoing proxied request.
    pub fn apply(&self, headers: &mut reqwest::header::HeaderMap) {
        let mut set = |name: &'static str, value: &Option<String>| {
            if let Some(value) = value {
                if let Ok(value) = reqwest::header::HeaderValue::from_str(value) {
                    headers.insert(name, value);
                }
            }
        };

        set(USER_ID_HEADER, &self.user_id);
        set(USER_HEADER, &self.user);
        set(USER_EMAIL_HEADER, &self.email);
        set(SESSION_ID_HEADER, &self.session_id);

        if !self.roles.is_empty() {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&self.roles.join(",")) {
                headers.insert(USER_ROLES_HEADER, value);
            }
        }
        if let Some(ref token) = self.access_token {
            if let Ok(value) =
                reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
    }
}

/// Pull one cookie out of the `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let (key, value) = pair.trim().split_once('=')?;
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    #[test]
    fn test_cookie_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "a=1; ploinky_sso=deadbeef; webtty_sid=cafe".parse().unwrap(),
        );
        assert_eq!(
            cookie_value(&headers, "ploinky_sso").as_deref(),
            Some("deadbeef")
        );
        assert_eq!(cookie_value(&headers, "webtty_sid").as_deref(), Some("cafe"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_identity_round_trip() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, "u1".parse().unwrap());
        headers.insert(USER_HEADER, "jo".parse().unwrap());
        headers.insert(USER_ROLES_HEADER, "admin, dev".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer tok123".parse().unwrap());
        headers.insert(header::COOKIE, "ploinky_sso=abc".parse().unwrap());

        let identity = Identity::from_headers(&headers);
        assert_eq!(identity.user_id.as_deref(), Some("u1"));
        assert_eq!(identity.roles, vec!["admin", "dev"]);
        assert_eq!(identity.access_token.as_deref(), Some("tok123"));
        assert_eq!(identity.session_id.as_deref(), Some("abc"));

        let mut out = reqwest::header::HeaderMap::new();
        identity.apply(&mut out);
        assert_eq!(out.get(USER_ROLES_HEADER).unwrap(), "admin,dev");
        assert_eq!(out.get(SESSION_ID_HEADER).unwrap(), "abc");
        assert_eq!(
            out.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer tok123"
        );
    }
}
