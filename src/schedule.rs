//! Builds the day's schedule: for every eligible victim, decide whether chaos should
//! be scheduled at all, and if so at what instant.
use std::fmt;

use chrono::DateTime;
use rand::Rng;

use crate::chaos::ChaosEntry;
use crate::config::Config;
use crate::victim::Victim;

/// A fully built schedule for a single day: zero or more [`ChaosEntry`] instances, each
/// already bound to a kill instant.
#[derive(Debug, Default)]
pub struct Schedule {
    entries: Vec<ChaosEntry>,
}

impl Schedule {
    /// Builds today's schedule from the given eligible victims.
    ///
    /// For each victim, [`should_schedule_chaos`] first decides whether to schedule it
    /// at all (probability derived from mtbf, unless debug overrides force the
    /// decision). If scheduled, [`crate::calendar::random_kill_times`] supplies one or
    /// more kill instants — more than one for victims with a short mtbf — unless debug
    /// immediate-kill is enabled, in which case [`calculate_kill_time`] is used instead.
    pub fn build(
        victims: Vec<Victim>,
        now: &DateTime<chrono_tz::Tz>,
        config: &Config,
        rng: &mut impl Rng,
    ) -> Self {
        let one_day = std::time::Duration::from_secs(24 * 3600);
        let mut entries = Vec::new();
        for victim in victims {
            if victim.mtbf() >= one_day {
                let mtbf_days = victim.mtbf().as_secs_f64() / 86400.0;
                if !should_schedule_chaos(mtbf_days, config, rng) {
                    continue;
                }
            }

            if config.debug.enabled && config.debug.schedule_immediate_kill {
                let kill_at = calculate_kill_time(now, rng);
                entries.push(ChaosEntry::new(victim, kill_at));
                continue;
            }

            let kill_times = crate::calendar::random_kill_times(
                now,
                victim.mtbf(),
                config.start_hour,
                config.end_hour,
                rng,
            );
            for kill_at in kill_times {
                entries.push(ChaosEntry::new(victim.clone(), kill_at));
            }
        }
        Schedule { entries }
    }

    /// The scheduled entries, in the order they were built.
    pub fn entries(&self) -> &[ChaosEntry] {
        &self.entries
    }

    /// Consumes the schedule, returning its entries.
    pub fn into_entries(self) -> Vec<ChaosEntry> {
        self.entries
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "********** Today's schedule **********")?;
        if self.entries.is_empty() {
            writeln!(f, "No terminations scheduled")?;
        } else {
            writeln!(f, "\t{:<30}\tTermination time", "Victim")?;
            writeln!(f, "\t{:<30}\t----------------", "------")?;
            for entry in &self.entries {
                writeln!(
                    f,
                    "\t{}/{}\t\t{}",
                    entry.victim().namespace(),
                    entry.victim().name(),
                    entry.kill_at()
                )?;
            }
        }
        write!(f, "********** End of schedule **********")
    }
}

/// Computes the kill instant used when debug immediate-kill is enabled: `now + U[0, 60s)`.
pub fn calculate_kill_time(
    now: &DateTime<chrono_tz::Tz>,
    rng: &mut impl Rng,
) -> DateTime<chrono_tz::Tz> {
    let offset_secs = rng.gen_range(0..60);
    *now + chrono::Duration::seconds(offset_secs)
}

/// Decides whether chaos should be scheduled today for a victim whose mtbf is at least
/// one day, expressed here in days. Debug force-kill always returns true; otherwise the
/// victim is included with probability `1 / mtbf_days`. Victims with a sub-day mtbf never
/// go through this gate — they are always scheduled (see [`Schedule::build`]).
pub fn should_schedule_chaos(mtbf_days: f64, config: &Config, rng: &mut impl Rng) -> bool {
    if config.debug.enabled && config.debug.force_should_kill {
        return true;
    }
    let probability = 1.0 / mtbf_days;
    probability > rng.gen::<f64>()
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::mock::StepRng;

    fn tz_now(y: i32, mo: u32, d: u32, h: u32) -> DateTime<chrono_tz::Tz> {
        chrono_tz::UTC
            .with_ymd_and_hms(y, mo, d, h, 0, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn force_should_kill_overrides_probability() {
        let mut config = Config::default();
        config.debug.enabled = true;
        config.debug.force_should_kill = true;
        let mut rng = StepRng::new(u64::MAX, 1);
        assert!(should_schedule_chaos(1_000_000.0, &config, &mut rng));
    }

    #[test]
    fn probability_gate_respects_rng() {
        let config = Config::default();
        // StepRng::new(0, 0) always yields gen::<f64>() close to 0, so any positive
        // probability should schedule.
        let mut low_rng = StepRng::new(0, 0);
        assert!(should_schedule_chaos(2.0, &config, &mut low_rng));
    }

    #[test]
    fn immediate_kill_debug_override_stays_within_a_minute() {
        let now = tz_now(2026, 7, 27, 12);
        let mut rng = StepRng::new(30, 1);
        let killtime = calculate_kill_time(&now, &mut rng);
        assert!(killtime >= now);
        assert!(killtime <= now + chrono::Duration::seconds(60));
    }

    #[test]
    fn display_lists_no_terminations_when_empty() {
        let schedule = Schedule::default();
        let rendered = schedule.to_string();
        assert!(rendered.contains("No terminations scheduled"));
    }

    fn victim_with_mtbf(name: &str, mtbf_label: &str) -> Victim {
        Victim::from_labels(
            crate::victim::ControllerKind::Deployment,
            name.to_string(),
            "default".to_string(),
            &[
                (crate::config::IDENT_LABEL_KEY.to_string(), name.to_string()),
                (crate::config::MTBF_LABEL_KEY.to_string(), mtbf_label.to_string()),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap()
    }

    #[test]
    fn sub_day_mtbf_is_always_scheduled_regardless_of_rng() {
        // StepRng::new(u64::MAX, 1) yields gen::<f64>() values close to 1, which would
        // fail the probability gate for any finite mtbf if it were (wrongly) applied.
        let mut rng = StepRng::new(u64::MAX, 1);
        let config = Config::default();
        let now = tz_now(2026, 7, 27, config.run_hour);
        let victim = victim_with_mtbf("web", "90m");
        let schedule = Schedule::build(vec![victim], &now, &config, &mut rng);
        assert!(!schedule.entries().is_empty());
    }

    #[test]
    fn day_plus_mtbf_respects_probability_gate() {
        let mut rng = StepRng::new(u64::MAX, 1);
        let config = Config::default();
        let now = tz_now(2026, 7, 27, config.run_hour);
        let victim = victim_with_mtbf("web", "10d");
        let schedule = Schedule::build(vec![victim], &now, &config, &mut rng);
        assert!(schedule.entries().is_empty());
    }
}
