//! Session plan generation.
//!
//! Each account gets a week of randomized work sessions. Start times are
//! staggered per account so the accounts never hammer the platform in
//! lockstep, and duration and item counts are drawn from configured ranges
//! so no two sessions look alike.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPlan {
    pub account_index: usize,
    pub scheduled_start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub max_items: u32,
    pub status: PlanStatus,
}

impl SessionPlan {
    #[must_use]
    pub fn end_time(&self) -> DateTime<Utc> {
        self.scheduled_start + Duration::minutes(i64::from(self.duration_minutes))
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == PlanStatus::Pending && self.scheduled_start <= now
    }
}

/// Generates plans for one account covering `cfg.horizon_days` starting at
/// `from`. Deterministic for a given rng seed.
pub fn generate_plans<R: Rng>(
    account_index: usize,
    from: DateTime<Utc>,
    cfg: &SessionConfig,
    rng: &mut R,
) -> Vec<SessionPlan> {
    let stagger_offset_hours = (account_index as u32 * cfg.stagger_hours) % 24;
    let mut plans = Vec::new();

    for day in 0..cfg.horizon_days {
        let day_start = from + Duration::days(i64::from(day));
        let count = rng.random_range(cfg.sessions_per_day_min..=cfg.sessions_per_day_max);
        // Spread the day's sessions over what remains of the day after the
        // stagger offset, each jittered inside its own slot. The last slot's
        // jitter still lands before midnight, so a day never spills into the
        // next one.
        let available_minutes = 24 * 60 - stagger_offset_hours * 60;
        let slot_minutes = available_minutes / count.max(1);

        for slot in 0..count {
            let jitter = rng.random_range(0..slot_minutes.max(1));
            let start = day_start
                + Duration::minutes(i64::from(
                    stagger_offset_hours * 60 + slot * slot_minutes + jitter,
                ));
            let duration_minutes = rng.random_range(cfg.duration_min_minutes..=cfg.duration_max_minutes);
            let max_items = rng.random_range(cfg.max_items_min..=cfg.max_items_max);

            plans.push(SessionPlan {
                account_index,
                scheduled_start: start,
                duration_minutes,
                max_items,
                status: PlanStatus::Pending,
            });
        }
    }

    plans.sort_by_key(|p| p.scheduled_start);
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cfg() -> SessionConfig {
        SessionConfig::default()
    }

    #[test]
    fn generation_is_deterministic_for_a_seed() {
        let from = Utc::now();
        let a = generate_plans(1, from, &cfg(), &mut StdRng::seed_from_u64(7));
        let b = generate_plans(1, from, &cfg(), &mut StdRng::seed_from_u64(7));
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.scheduled_start, y.scheduled_start);
            assert_eq!(x.duration_minutes, y.duration_minutes);
            assert_eq!(x.max_items, y.max_items);
        }
    }

    #[test]
    fn per_day_count_and_bounds_respected() {
        let c = cfg();
        let from = Utc::now();
        let total_count: usize = (0..8)
            .map(|seed| {
                let plans = generate_plans(0, from, &c, &mut StdRng::seed_from_u64(seed));

                // Each calendar day of the horizon holds that day's drawn
                // session count, nothing spilled from a neighbor.
                for day in 0..c.horizon_days {
                    let day_start = from + Duration::days(i64::from(day));
                    let day_end = day_start + Duration::days(1);
                    let in_day = plans
                        .iter()
                        .filter(|p| p.scheduled_start >= day_start && p.scheduled_start < day_end)
                        .count();
                    assert!(in_day >= c.sessions_per_day_min as usize, "day {day}");
                    assert!(in_day <= c.sessions_per_day_max as usize, "day {day}");
                }

                for p in &plans {
                    assert!(p.duration_minutes >= c.duration_min_minutes);
                    assert!(p.duration_minutes <= c.duration_max_minutes);
                    assert!(p.max_items >= c.max_items_min);
                    assert!(p.max_items <= c.max_items_max);
                }
                plans.len()
            })
            .sum();
        assert!(total_count >= (c.sessions_per_day_min * c.horizon_days) as usize * 8);
    }

    #[test]
    fn no_day_spills_past_midnight_even_with_stagger() {
        let from = Utc::now();
        let c = cfg();
        // Account 3 carries the largest default stagger offset (18h).
        for seed in 0..8 {
            let plans = generate_plans(3, from, &c, &mut StdRng::seed_from_u64(seed));
            for p in &plans {
                let offset = p.scheduled_start - from;
                let within_day = offset - Duration::days(offset.num_days());
                assert!(within_day >= Duration::hours(18), "{within_day}");
                assert!(within_day < Duration::days(1), "{within_day}");
            }
        }
    }

    #[test]
    fn accounts_are_staggered() {
        let from = Utc::now();
        let c = cfg();
        let b = generate_plans(1, from, &c, &mut StdRng::seed_from_u64(1));
        // Account 1 never starts a session before its stagger offset.
        for p in &b {
            let offset = p.scheduled_start - from;
            let within_day = offset - Duration::days(offset.num_days());
            assert!(within_day >= Duration::hours(i64::from(c.stagger_hours)));
        }
    }

    #[test]
    fn plans_come_out_sorted() {
        let plans = generate_plans(2, Utc::now(), &cfg(), &mut StdRng::seed_from_u64(9));
        for pair in plans.windows(2) {
            assert!(pair[0].scheduled_start <= pair[1].scheduled_start);
        }
    }
}
