//! The long-lived scheduling loop: sleep until the next run time, build a schedule,
//! fan out terminations, and collect the results.
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::chaos::ChaosResult;
use crate::config::Config;
use crate::notifications::NotificationClient;
use crate::schedule::Schedule;
use crate::victim;

/// Runs the scheduling loop forever. Each iteration: wait until the configured run
/// hour (or a fixed debug delay), enumerate eligible victims, build today's schedule,
/// spawn one task per entry, and wait for every result before looping again.
pub async fn run(config: Config, client: kube::Client, notifier: NotificationClient) -> ! {
    let tz = config
        .timezone_or_err()
        .expect("config was validated at startup");

    loop {
        sleep_until_next_run(&config, tz).await;

        let now = Utc::now().with_timezone(&tz);
        let victims = match victim::eligible_victims(client.clone(), &config).await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "failed to enumerate eligible victims, skipping this cycle");
                continue;
            }
        };
        info!(count = victims.len(), "found eligible victims");

        let mut rng = StdRng::from_entropy();
        let schedule = Schedule::build(victims, &now, &config, &mut rng);
        info!("{}", schedule);

        if config.notifications.enabled && config.notifications.report_schedule {
            notifier
                .report_schedule(&config.notifications.attacks, &schedule)
                .await;
        }

        run_schedule(schedule, client.clone(), &config, &notifier).await;
    }
}

async fn sleep_until_next_run(config: &Config, tz: chrono_tz::Tz) {
    let delay = if config.debug.enabled {
        std::time::Duration::from_secs(config.debug.schedule_delay_sec)
    } else {
        let now = Utc::now().with_timezone(&tz);
        let next_run = crate::calendar::next_runtime(&now, config.run_hour);
        (next_run - now).to_std().unwrap_or(std::time::Duration::ZERO)
    };
    info!(seconds = delay.as_secs(), "sleeping until next scheduling run");
    tokio::time::sleep(delay).await;
}

/// Spawns one task per schedule entry, each sleeping until its own kill instant before
/// executing, and forwards every result to the notifier and the log as it arrives.
async fn run_schedule(
    schedule: Schedule,
    client: kube::Client,
    config: &Config,
    notifier: &NotificationClient,
) {
    let entries = schedule.into_entries();
    let total = entries.len();
    if total == 0 {
        info!("no terminations scheduled for today");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ChaosResult>();

    for entry in entries {
        let tx = tx.clone();
        let client = client.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let now = Utc::now().with_timezone(&chrono_tz::UTC);
            let kill_at = entry.kill_at().with_timezone(&chrono_tz::UTC);
            let delay = (kill_at - now).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(delay).await;

            let result = entry.execute(client, &config, &mut rng).await;
            let _ = tx.send(result);
        });
    }
    drop(tx);

    let mut completed = 0;
    while let Some(result) = rx.recv().await {
        completed += 1;
        log_result(&result);
        if config.notifications.enabled {
            notifier
                .report_attack(&config.notifications.attacks, &result, Utc::now())
                .await;
        }
    }

    if completed != total {
        warn!(completed, total, "result channel closed before all terminations reported");
    }
    info!("all scheduled terminations for today have run");
}

fn log_result(result: &ChaosResult) {
    use crate::chaos::ChaosOutcome;
    match result.outcome() {
        ChaosOutcome::Success => {
            info!(
                victim = result.victim().name(),
                namespace = result.victim().namespace(),
                "termination succeeded"
            );
        }
        ChaosOutcome::Skipped(reason) => {
            info!(victim = result.victim().name(), %reason, "termination skipped");
        }
        ChaosOutcome::Failed(e) => {
            error!(
                victim = result.victim().name(),
                namespace = result.victim().namespace(),
                error = %e,
                "termination failed"
            );
        }
    }
}
