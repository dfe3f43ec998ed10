use std::sync::Arc;

use crate::{
    api::PageOptions,
    config::Config,
    errors::OAuthError,
    oauth::SessionManager,
    store::{SqliteTokenStore, TokenStore},
    traits::{Clock, SystemClock},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub session: Arc<SessionManager>,
}

impl AppState {
    pub async fn from_env() -> color_eyre::Result<Self> {
        let config = Config::from_env()?;

        println!("TOKEN_DB_PATH: {}", config.token_db_path.display());
        println!("KLAVIYO_BASE_URL: {}", config.oauth.base_url);

        let store = SqliteTokenStore::open(&config.token_db_path).await?;

        Ok(Self::new(config, Arc::new(store), Arc::new(SystemClock)).await?)
    }

    pub async fn new(
        config: Config,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OAuthError> {
        let session = SessionManager::load(config.oauth.clone(), store, clock).await?;

        Ok(Self {
            config: Arc::new(config),
            session: Arc::new(session),
        })
    }

    pub fn page_options(&self) -> PageOptions {
        PageOptions {
            pagination: self.config.pagination,
            max_pages: self.config.max_pages,
        }
    }
}
