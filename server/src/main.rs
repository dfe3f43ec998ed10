use klaviyo_oauth_demo::{
    config::Config,
    cron, routes,
    server::run_server,
    setup::{setup_sentry, setup_tracing},
    state::AppState,
};
use tracing::{info, warn};

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    // Initialize Sentry for error tracking
    let _sentry_guard = setup_sentry();

    // Create and run the tokio runtime
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?
        .block_on(async { run_application().await })
}

async fn run_application() -> color_eyre::Result<()> {
    setup_tracing("klaviyo_oauth_demo")?;

    println!("\n========== 🔑 KLAVIYO OAUTH DEMO STARTING ==========");

    let app_state = AppState::from_env().await?;
    report_configuration(&app_state.config);

    info!("Spawning application tasks");
    let futures = spawn_application_tasks(app_state).await?;

    for result in futures::future::try_join_all(futures).await? {
        result?;
    }

    Ok(())
}

/// Missing credentials are not fatal; the login flow reports them when used.
fn report_configuration(config: &Config) {
    let missing = config.oauth.credentials.missing();
    if missing.is_empty() {
        info!("🎉 all required data is present");
    } else {
        warn!(
            "🛑 please provide required .env data, missing: {}",
            missing.join(", ")
        );
    }
}

/// Spawn all application background tasks
async fn spawn_application_tasks(
    app_state: AppState,
) -> color_eyre::Result<Vec<tokio::task::JoinHandle<color_eyre::Result<()>>>> {
    let mut futures = vec![];

    if is_feature_enabled("SERVER") {
        info!("Server Enabled");
        futures.push(tokio::spawn(run_server(
            routes::routes(app_state.clone()),
            app_state.config.port,
        )));
    } else {
        info!("Server Disabled");
    }

    if is_feature_enabled("CRON") {
        info!("Cron Enabled");
        futures.push(tokio::spawn(cron::run_cron(app_state.clone())));
    } else {
        info!("Cron Disabled");
    }

    info!("All application tasks spawned successfully");
    Ok(futures)
}

/// Check if a feature is enabled based on environment variables
fn is_feature_enabled(feature: &str) -> bool {
    std::env::var(format!("{}_DISABLED", feature)).unwrap_or_else(|_| "false".to_string()) != "true"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_is_feature_enabled_when_env_var_not_set() -> color_eyre::Result<()> {
        // Ensure the environment variable is not set
        env::remove_var("TEST_FEATURE_DISABLED");

        // Feature should be enabled when env var is not set
        assert!(is_feature_enabled("TEST_FEATURE"));

        Ok(())
    }

    #[test]
    fn test_is_feature_enabled_with_other_values() -> color_eyre::Result<()> {
        // Anything other than exactly "true" leaves the feature on
        env::set_var("OTHER_FEATURE_DISABLED", "yes");
        assert!(is_feature_enabled("OTHER_FEATURE"));

        env::set_var("OTHER_FEATURE_DISABLED", "false");
        assert!(is_feature_enabled("OTHER_FEATURE"));

        env::remove_var("OTHER_FEATURE_DISABLED");

        Ok(())
    }

    #[test]
    fn test_is_feature_disabled_when_env_var_is_true() -> color_eyre::Result<()> {
        env::set_var("CRON_FEATURE_DISABLED", "true");

        assert!(!is_feature_enabled("CRON_FEATURE"));

        env::remove_var("CRON_FEATURE_DISABLED");

        Ok(())
    }
}
