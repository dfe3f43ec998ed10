use clap::Parser;
use fixtures::klaviyo::{KlaviyoFixture, ProviderConfig, FIXTURE_CLIENT_ID, FIXTURE_CLIENT_SECRET};
use fixtures::{require_env_var, run_server, FixtureArgs};
use tracing::info;

/// Fake Klaviyo OAuth provider and API
#[derive(Parser, Debug)]
#[clap(name = "klaviyo-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,

    /// Base URL the fixture is reachable at, used for pagination links
    #[arg(long)]
    public_url: Option<String>,

    /// Lifetime of issued access tokens, in seconds
    #[arg(long, default_value = "3600")]
    expires_in: i64,

    /// Records per page on the collection endpoints
    #[arg(long, default_value = "2")]
    page_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let client_id = require_env_var("CLIENT_ID", args.common.force, FIXTURE_CLIENT_ID)?;
    let client_secret = require_env_var("CLIENT_SECRET", args.common.force, FIXTURE_CLIENT_SECRET)?;

    let base_url = args
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", args.common.host, args.common.port));

    let fixture = KlaviyoFixture::new(ProviderConfig {
        client_id,
        client_secret,
        expires_in: args.expires_in,
        page_size: args.page_size,
        ..ProviderConfig::new(base_url)
    });

    info!("Klaviyo fixture serving as {}", fixture.base_url());
    run_server(args.common, fixture.router()).await
}
