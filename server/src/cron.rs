use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::{
    oauth::{SessionManager, TickOutcome},
    state::AppState,
};

/// Receives the outcome of every background refresh tick.
pub trait RefreshObserver: Send + Sync {
    fn on_tick(&self, outcome: &TickOutcome);
}

/// Default observer: write the outcome to the log.
#[derive(Debug, Default)]
pub struct LogObserver;

impl RefreshObserver for LogObserver {
    fn on_tick(&self, outcome: &TickOutcome) {
        match outcome {
            TickOutcome::Refreshed => info!("Background token refresh succeeded"),
            TickOutcome::Skipped => {
                tracing::debug!("Background token refresh skipped, nothing to refresh")
            }
            TickOutcome::Failed(err) => error!("Background token refresh failed: {}", err),
        }
    }
}

pub async fn run_cron(app_state: AppState) -> color_eyre::Result<()> {
    info!(
        "Refreshing tokens every {} seconds",
        app_state.config.refresh_interval.as_secs()
    );

    run_refresh_loop(
        app_state.session.clone(),
        app_state.config.refresh_interval,
        Arc::new(LogObserver),
    )
    .await;

    Ok(())
}

/// Tick forever, one refresh attempt per `period`. The first tick fires one
/// full period after start.
///
/// Each tick runs in its own task so a panic inside it is reported to the
/// observer instead of ending the loop.
pub async fn run_refresh_loop(
    session: Arc<SessionManager>,
    period: Duration,
    observer: Arc<dyn RefreshObserver>,
) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let session = session.clone();
        let outcome = match tokio::spawn(async move { session.background_refresh_tick().await }).await
        {
            Ok(outcome) => outcome,
            Err(err) => TickOutcome::Failed(format!("refresh task aborted: {err}")),
        };

        observer.on_tick(&outcome);
    }
}
