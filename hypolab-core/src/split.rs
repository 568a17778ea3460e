//! Randomized train/test date splits.
//!
//! Splits are computed backwards from the fixed dataset end: the latest
//! admissible test start is derived first, a start is drawn inside the
//! admissible window, and only then are the remaining dates placed. No date
//! is ever computed past `dataset_end` and clamped afterwards.
//!
//! Day arithmetic is calendar-day differences: a window `[a, b]` has length
//! `b - a` days. With `train_end = test_start - 1`, the earliest test start
//! is `dataset_start + min_train_days + 1`.

use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SplitError {
    #[error(
        "insufficient history: {available_days} days available, \
         {required_days} required (min_train_days + min_test_days + 1)"
    )]
    InsufficientHistory {
        available_days: i64,
        required_days: i64,
    },
}

/// One train/test partition of the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateSplit {
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
}

impl DateSplit {
    pub fn train_days(&self) -> i64 {
        (self.train_end - self.train_start).num_days()
    }

    pub fn test_days(&self) -> i64 {
        (self.test_end - self.test_start).num_days()
    }
}

impl std::fmt::Display for DateSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "train {}..{} / test {}..{}",
            self.train_start, self.train_end, self.test_start, self.test_end
        )
    }
}

/// Draw a boundary-safe split of `[dataset_start, dataset_end]`.
///
/// The dataset must span at least `min_train_days + min_test_days + 1`
/// days: the train window ends the day before the test window starts, so a
/// span of exactly `min_train_days + min_test_days` leaves no room for a
/// full train window and fails with [`SplitError::InsufficientHistory`].
///
/// # Panics
///
/// Panics if a post-condition is violated. That is a bug in this function,
/// never a property of the input.
pub fn generate_split(
    dataset_start: NaiveDate,
    dataset_end: NaiveDate,
    min_train_days: u32,
    min_test_days: u32,
    seed: u64,
) -> Result<DateSplit, SplitError> {
    let min_train = i64::from(min_train_days);
    let min_test = i64::from(min_test_days);
    let available_days = (dataset_end - dataset_start).num_days();
    let required_days = min_train + min_test + 1;

    let insufficient = SplitError::InsufficientHistory {
        available_days,
        required_days,
    };
    if available_days < required_days {
        return Err(insufficient);
    }

    let latest_test_start = dataset_end - Duration::days(min_test);
    let earliest_test_start = dataset_start + Duration::days(min_train + 1);
    if earliest_test_start > latest_test_start {
        return Err(insufficient);
    }

    let window = (latest_test_start - earliest_test_start).num_days();
    let mut rng = StdRng::seed_from_u64(seed);
    let offset = rng.gen_range(0..=window);

    let test_start = earliest_test_start + Duration::days(offset);
    let test_end = (test_start + Duration::days(min_test)).min(dataset_end);
    let train_end = test_start - Duration::days(1);
    let train_start = dataset_start;

    let split = DateSplit {
        train_start,
        train_end,
        test_start,
        test_end,
    };

    assert!(split.test_end <= dataset_end, "split overshoots dataset end: {split}");
    assert!(split.train_end < split.test_start, "look-ahead in split: {split}");
    assert!(split.train_start >= dataset_start, "split starts before dataset: {split}");
    assert!(split.test_days() >= min_test, "test window too short: {split}");
    assert!(split.train_days() >= min_train, "train window too short: {split}");

    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn split_respects_all_bounds() {
        let start = d(2015, 1, 1);
        let end = d(2024, 12, 31);
        for seed in 0..200 {
            let s = generate_split(start, end, 730, 180, seed).unwrap();
            assert!(s.test_end <= end);
            assert!(s.train_end < s.test_start);
            assert_eq!(s.train_start, start);
            assert!(s.test_days() >= 180);
            assert!(s.train_days() >= 730);
        }
    }

    #[test]
    fn same_seed_same_split() {
        let a = generate_split(d(2018, 1, 1), d(2024, 1, 1), 365, 90, 99).unwrap();
        let b = generate_split(d(2018, 1, 1), d(2024, 1, 1), 365, 90, 99).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn seeds_spread_test_start() {
        let starts: std::collections::HashSet<NaiveDate> = (0..50)
            .map(|seed| {
                generate_split(d(2015, 1, 1), d(2024, 1, 1), 365, 90, seed)
                    .unwrap()
                    .test_start
            })
            .collect();
        assert!(starts.len() > 10, "expected varied test starts, got {}", starts.len());
    }

    #[test]
    fn too_short_history_fails() {
        let err = generate_split(d(2023, 1, 1), d(2023, 6, 1), 365, 90, 0).unwrap_err();
        match err {
            SplitError::InsufficientHistory {
                available_days,
                required_days,
            } => {
                assert_eq!(available_days, 151);
                assert_eq!(required_days, 456);
            }
        }
    }

    #[test]
    fn exact_fit_needs_one_extra_day() {
        // span == train + test leaves no room for the day between windows
        let start = d(2020, 1, 1);
        let end = start + Duration::days(100);
        assert_eq!(
            generate_split(start, end, 70, 30, 0).unwrap_err(),
            SplitError::InsufficientHistory {
                available_days: 100,
                required_days: 101,
            }
        );

        let end = start + Duration::days(101);
        let s = generate_split(start, end, 70, 30, 0).unwrap();
        assert_eq!(s.test_end, end);
        assert_eq!(s.train_days(), 70);
        assert_eq!(s.test_days(), 30);
    }

    #[test]
    fn test_window_ends_at_dataset_end_when_latest() {
        let start = d(2020, 1, 1);
        let end = d(2021, 1, 1);
        for seed in 0..100 {
            let s = generate_split(start, end, 200, 30, seed).unwrap();
            assert_eq!(s.test_end - s.test_start, Duration::days(30));
            assert!(s.test_end <= end);
        }
    }
}
