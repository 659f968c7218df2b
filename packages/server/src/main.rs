use job_pusher::{JobPusher, PusherConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "job_pusher=info,scheduler=info,db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PusherConfig::from_env()?;
    let pusher = JobPusher::start(config).await?;

    let topics = pusher.store().all_topics().await?;
    tracing::info!("Serving {} topics", topics.len());

    tokio::signal::ctrl_c().await?;
    pusher.shutdown().await?;

    Ok(())
}
