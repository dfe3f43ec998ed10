use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use color_eyre::eyre::{eyre, WrapErr};

const DEFAULT_BASE_URL: &str = "https://a.klaviyo.com";
const DEFAULT_REVISION: &str = "2023-08-15";

/// Which flavour of the authorization-code grant to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowVariant {
    /// Authorization code with PKCE; client credentials go in a Basic auth header.
    #[default]
    Pkce,
    /// Plain authorization code; client id and secret go in the form body.
    ClientSecret,
}

impl FromStr for FlowVariant {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pkce" => Ok(Self::Pkce),
            "client_secret" | "client-secret" | "plain" => Ok(Self::ClientSecret),
            other => Err(eyre!("Unknown OAUTH_FLOW value: {other}")),
        }
    }
}

/// How upstream collections are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaginationPolicy {
    #[default]
    SinglePage,
    /// Follow `links.next` until it runs out (or `max_pages` is hit).
    CursorFollow,
}

impl FromStr for PaginationPolicy {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single_page" | "single-page" => Ok(Self::SinglePage),
            "cursor" | "cursor_follow" | "cursor-follow" => Ok(Self::CursorFollow),
            other => Err(eyre!("Unknown PAGINATION value: {other}")),
        }
    }
}

/// OAuth client registration. Every field is optional at load time; what is
/// missing is reported at startup and enforced by the operations that need it.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
}

impl Credentials {
    /// Names of the variables needed to start a login that are not set.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = vec![];
        if self.client_id.is_none() {
            missing.push("CLIENT_ID");
        }
        if self.redirect_uri.is_none() {
            missing.push("REDIRECT_URI");
        }
        if self.scope.is_none() {
            missing.push("SCOPE");
        }
        missing
    }
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub credentials: Credentials,
    pub flow: FlowVariant,
    pub base_url: String,
    pub revision: String,
    pub timeout: Duration,
}

impl OAuthConfig {
    pub fn authorize_url(&self) -> String {
        format!("{}/oauth/authorize", self.base_url)
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth/token", self.base_url)
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub oauth: OAuthConfig,
    pub pagination: PaginationPolicy,
    pub max_pages: usize,
    pub refresh_interval: Duration,
    pub token_db_path: PathBuf,
    pub static_dir: PathBuf,
    pub port: u16,
    pub production: bool,
}

impl Config {
    pub fn from_env() -> color_eyre::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> color_eyre::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let credentials = Credentials {
            client_id: var("CLIENT_ID"),
            client_secret: var("CLIENT_SECRET"),
            redirect_uri: var("REDIRECT_URI"),
            scope: var("SCOPE"),
        };

        let flow = var("OAUTH_FLOW")
            .map(|value| value.parse::<FlowVariant>())
            .transpose()?
            .unwrap_or_default();

        let pagination = var("PAGINATION")
            .map(|value| value.parse::<PaginationPolicy>())
            .transpose()?
            .unwrap_or_default();

        let production = var("NODE_ENV").is_some_and(|env| env == "production");
        let default_port = if production { 80 } else { 3000 };

        Ok(Self {
            oauth: OAuthConfig {
                credentials,
                flow,
                base_url: var("KLAVIYO_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                revision: var("KLAVIYO_REVISION").unwrap_or_else(|| DEFAULT_REVISION.to_string()),
                timeout: Duration::from_secs(parse_positive(&var, "UPSTREAM_TIMEOUT_SECS", 10)?),
            },
            pagination,
            max_pages: parse_number(&var, "MAX_PAGES", 20)?,
            refresh_interval: Duration::from_secs(parse_positive(&var, "REFRESH_INTERVAL_SECS", 600)?),
            token_db_path: var("TOKEN_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("scratch/tokens.db")),
            static_dir: var("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("dist")),
            port: parse_number(&var, "PORT", default_port)?,
            production,
        })
    }
}

fn parse_number<T, F>(var: &F, name: &str, default: T) -> color_eyre::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse()
            .wrap_err_with(|| format!("Failed to parse {name}={value}")),
        None => Ok(default),
    }
}

/// Like [`parse_number`], for durations that must not be zero.
fn parse_positive<F>(var: &F, name: &str, default: u64) -> color_eyre::Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_number(var, name, default)? {
        0 => Err(eyre!("{name} must be greater than zero")),
        value => Ok(value),
    }
}
