use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Body of a successful token endpoint response. Every field is optional so
/// that error bodies still deserialize and can be inspected; fields with an
/// unexpected shape read as absent instead of failing the whole body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default, deserialize_with = "lenient_string")]
    pub access_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub scope: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl TokenResponse {
    /// A usable grant needs both tokens and no `error` field.
    pub fn into_grant(self) -> Option<TokenGrant> {
        if self.error.is_some() {
            return None;
        }

        match (self.access_token, self.refresh_token) {
            (Some(access_token), Some(refresh_token))
                if !access_token.is_empty() && !refresh_token.is_empty() =>
            {
                Some(TokenGrant {
                    access_token,
                    refresh_token,
                    expires_in: self.expires_in,
                })
            }
            _ => None,
        }
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(value)) => Some(value),
        _ => None,
    })
}

/// Seconds as an integer, a float, or a numeric string.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    })
}

/// An access/refresh pair that was accepted from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the access token in seconds, when the provider sent one.
    pub expires_in: Option<i64>,
}

/// The cached OAuth session. Both tokens are present or both are absent.
///
/// `expires_in` of `None` means the lifetime is unknown: the clock never
/// expires the token, and the 401 path and the background timer refresh it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    tokens: Option<(String, String)>,
    expires_in: Option<i64>,
    issued_at: i64,
}

impl Session {
    /// A session restored from storage. Its age is unknown, so it is treated
    /// as already expired.
    pub(crate) fn hydrated(access_token: String, refresh_token: String, now: i64) -> Self {
        Self {
            tokens: Some((access_token, refresh_token)),
            expires_in: Some(0),
            issued_at: now,
        }
    }

    pub(crate) fn empty(now: i64) -> Self {
        Self {
            tokens: None,
            expires_in: Some(0),
            issued_at: now,
        }
    }

    pub(crate) fn install(&mut self, grant: TokenGrant, now: i64) {
        self.tokens = Some((grant.access_token, grant.refresh_token));
        self.expires_in = grant.expires_in;
        self.issued_at = now;
    }

    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|(access, _)| access.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|(_, refresh)| refresh.as_str())
    }

    pub fn expires_in(&self) -> Option<i64> {
        self.expires_in
    }

    /// Unix timestamp (seconds) of the last successful exchange or refresh.
    pub fn issued_at(&self) -> i64 {
        self.issued_at
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_in
            .is_some_and(|expires_in| now - self.issued_at >= expires_in)
    }

    /// True when the token expires within `margin` seconds of `now`.
    pub fn expires_within(&self, now: i64, margin: i64) -> bool {
        self.expires_in
            .is_some_and(|expires_in| now - self.issued_at >= expires_in - margin)
    }
}
