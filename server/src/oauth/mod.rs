//! OAuth token lifecycle for the Klaviyo integration
//! This covers PKCE helpers, token responses and the session manager

pub mod pkce;
pub mod session;
pub mod token;

pub use session::{RefreshOutcome, RefreshTrigger, SessionManager, SessionState, TickOutcome};
pub use token::{Session, TokenGrant, TokenResponse};
