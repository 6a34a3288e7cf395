use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use deal_finder::DealFinder;
use deal_finder::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for warning in settings.warnings() {
        warn!("{}", warning);
    }

    info!(
        "Starting deal finder: {} categories, posting to {}",
        settings.categories.len(),
        settings.telegram_channel_id
    );

    let schedule = settings.run_schedule.clone();
    let legacy_store = settings.legacy_json_path.clone();
    let finder = DealFinder::new(settings).await?;

    if let Some(path) = legacy_store
        && path.exists()
        && let Err(e) = finder.store().import_json(&path).await
    {
        error!("Failed to import legacy store {}: {}", path.display(), e);
    }

    match finder.prune().await {
        Ok(pruned) => info!("Pruned {} expired records", pruned),
        Err(e) => error!("Error pruning dedup store: {}", e),
    }

    run(&finder).await;

    let Some(schedule) = schedule else {
        return Ok(());
    };

    let sched = JobScheduler::new().await?;

    let job_finder = finder.clone();
    let running = Arc::new(Mutex::new(()));
    sched
        .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let finder = job_finder.clone();
            let running = running.clone();
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("Previous run still in progress; skipping this tick");
                    return;
                };
                run(&finder).await;
            })
        })?)
        .await?;

    info!("Scheduler started with schedule {:?}", schedule);
    sched.start().await?;

    // Keep the program running
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
    }
}

async fn run(finder: &DealFinder) {
    if let Err(e) = finder.run_once().await {
        error!("Error during deal run: {}", e);
    }
}
