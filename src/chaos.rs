//! A single scheduled termination: a victim bound to a kill instant, plus the
//! execution logic that verifies the victim is still eligible and dispatches on its
//! kill mode.
use chrono::{DateTime, TimeZone};
use rand::Rng;
use thiserror::Error;

use crate::config::Config;
use crate::victim::{KillMode, Victim, VictimApiError};

/// One entry in a built [`crate::schedule::Schedule`]: a victim and the instant it
/// should be attacked at.
#[derive(Debug, Clone)]
pub struct ChaosEntry<Tz: TimeZone = chrono_tz::Tz> {
    victim: Victim,
    kill_at: DateTime<Tz>,
}

/// Why a scheduled termination did not run, distinct from an outright execution error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The victim opted out between scheduling and execution time.
    #[error("{0} is no longer enrolled, skipping")]
    NoLongerEnrolled(String),
    /// The victim's namespace was blacklisted between scheduling and execution time.
    #[error("{0} is blacklisted, skipping")]
    Blacklisted(String),
    /// The victim's namespace fell off the whitelist between scheduling and execution time.
    #[error("{0} is not whitelisted, skipping")]
    NotWhitelisted(String),
}

/// The outcome of executing a single [`ChaosEntry`], published on the run loop's result
/// channel.
#[derive(Debug)]
pub enum ChaosOutcome {
    /// Pods were terminated successfully.
    Success,
    /// Execution was deliberately skipped; not an error.
    Skipped(SkipReason),
    /// Execution failed.
    Failed(VictimApiError),
}

/// A published result, carrying enough victim identity for logging and notification
/// regardless of outcome.
#[derive(Debug)]
pub struct ChaosResult {
    victim: Victim,
    outcome: ChaosOutcome,
}

impl ChaosResult {
    /// The victim this result is about.
    pub fn victim(&self) -> &Victim {
        &self.victim
    }

    /// The execution outcome.
    pub fn outcome(&self) -> &ChaosOutcome {
        &self.outcome
    }

    /// `Some(error string)` if this result represents a failure or a skip, `None` on
    /// success — mirroring the nil-means-ok `error` carried by a Go result type.
    pub fn error_message(&self) -> Option<String> {
        match &self.outcome {
            ChaosOutcome::Success => None,
            ChaosOutcome::Skipped(reason) => Some(reason.to_string()),
            ChaosOutcome::Failed(e) => Some(e.to_string()),
        }
    }
}

impl<Tz: TimeZone> ChaosEntry<Tz> {
    /// Builds a new entry.
    pub fn new(victim: Victim, kill_at: DateTime<Tz>) -> Self {
        Self { victim, kill_at }
    }

    /// The victim bound to this entry.
    pub fn victim(&self) -> &Victim {
        &self.victim
    }

    /// The instant this entry should execute at.
    pub fn kill_at(&self) -> &DateTime<Tz> {
        &self.kill_at
    }
}

impl<Tz> ChaosEntry<Tz>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
    DateTime<Tz>: std::ops::Sub<DateTime<Tz>, Output = chrono::Duration>,
{
    /// How long to wait, from `now`, before this entry should execute. Zero if the
    /// instant has already passed.
    pub fn duration_until(&self, now: &DateTime<Tz>) -> std::time::Duration {
        let delta = self.kill_at.clone() - now.clone();
        delta.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

impl ChaosEntry<chrono_tz::Tz> {
    /// Verifies the victim is still eligible, then terminates pods according to its
    /// kill mode, publishing a single [`ChaosResult`].
    pub async fn execute(self, client: kube::Client, config: &Config, rng: &mut impl Rng) -> ChaosResult {
        let victim = self.victim;

        if let Err(outcome) = verify_execution(&victim, client.clone(), config).await {
            return ChaosResult { victim, outcome };
        }

        let outcome = match terminate(&victim, client, config, rng).await {
            Ok(()) => ChaosOutcome::Success,
            Err(e) => ChaosOutcome::Failed(e),
        };
        ChaosResult { victim, outcome }
    }
}

async fn verify_execution(
    victim: &Victim,
    client: kube::Client,
    config: &Config,
) -> Result<(), ChaosOutcome> {
    let label = format!("{} {}", victim.kind().label(), victim.name());

    match victim.is_enrolled(client).await {
        Ok(true) => {}
        Ok(false) => return Err(ChaosOutcome::Skipped(SkipReason::NoLongerEnrolled(label))),
        Err(e) => return Err(ChaosOutcome::Failed(e)),
    }

    if victim.is_blacklisted(config) {
        return Err(ChaosOutcome::Skipped(SkipReason::Blacklisted(label)));
    }

    if !victim.is_whitelisted(config) {
        return Err(ChaosOutcome::Skipped(SkipReason::NotWhitelisted(label)));
    }

    Ok(())
}

async fn terminate(
    victim: &Victim,
    client: kube::Client,
    config: &Config,
    rng: &mut impl Rng,
) -> Result<(), VictimApiError> {
    let kill_type = victim.kill_type(client.clone()).await?;

    let kill_num = match kill_type {
        KillMode::Fixed(n) => n,
        KillMode::KillAll => {
            let running = victim.running_pods(client.clone()).await?;
            running.len() as i64
        }
        KillMode::PodDisruptionBudget => {
            let selector = victim.selector(client.clone()).await?;
            let (desired, healthy) = victim.pod_disruption_budget(client.clone(), &selector).await?;
            victim.kill_number_for_pod_disruption_budget(desired, healthy)?
        }
        KillMode::RandomMaxPercentage(max_pct) => {
            let running = victim.running_pods(client.clone()).await?;
            Victim::kill_number_for_max_percentage(running.len(), max_pct, rng)
        }
        KillMode::FixedPercentage(pct) => {
            let running = victim.running_pods(client.clone()).await?;
            Victim::kill_number_for_fixed_percentage(running.len(), pct)
        }
        KillMode::SingleRandomPod => 1,
    };

    victim
        .delete_random_pods(client, kill_num, config.grace_period_sec, config.dry_run, rng)
        .await
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn victim() -> Victim {
        crate::victim::Victim::from_labels(
            crate::victim::ControllerKind::Deployment,
            "web".to_string(),
            "default".to_string(),
            &[
                (crate::config::IDENT_LABEL_KEY.to_string(), "abc".to_string()),
                (crate::config::MTBF_LABEL_KEY.to_string(), "2".to_string()),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap()
    }

    #[test]
    fn duration_until_future_instant_is_positive() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 7, 27, 8, 0, 0).single().unwrap();
        let kill_at = chrono::Utc.with_ymd_and_hms(2026, 7, 27, 9, 0, 0).single().unwrap();
        let entry = ChaosEntry::new(victim(), kill_at);
        assert_eq!(entry.duration_until(&now), std::time::Duration::from_secs(3600));
    }

    #[test]
    fn duration_until_past_instant_is_zero() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 7, 27, 9, 0, 0).single().unwrap();
        let kill_at = chrono::Utc.with_ymd_and_hms(2026, 7, 27, 8, 0, 0).single().unwrap();
        let entry = ChaosEntry::new(victim(), kill_at);
        assert_eq!(entry.duration_until(&now), std::time::Duration::ZERO);
    }

    #[test]
    fn skip_reasons_render_victim_identity() {
        let reason = SkipReason::Blacklisted("Deployment web".to_string());
        assert!(reason.to_string().contains("Deployment web"));
    }
}
