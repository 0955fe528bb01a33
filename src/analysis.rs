//! Heart rate analysis over downloaded samples.
//!
//! Rolling averages are evaluated on a fixed grid: for stride `S` the grid
//! starts at the first multiple of `S` at or after the earliest sample and
//! ends at the latest sample. Each grid point `t` averages the samples with
//! timestamps in `(t - W, t]`. Grid points whose window is empty are left out.

use crate::types::HistoricalDataPacket;
use serde::{Deserialize, Serialize};

/// One minute in milliseconds
pub const MS_1MIN: u64 = 60 * 1000;
/// Two minutes in milliseconds
pub const MS_2MIN: u64 = 2 * MS_1MIN;
/// Five minutes in milliseconds
pub const MS_5MIN: u64 = 5 * MS_1MIN;
/// Twenty-four hours in milliseconds
pub const MS_24H: u64 = 24 * 60 * MS_1MIN;

/// A heart rate at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysedDataPoint {
    /// Milliseconds since the unix epoch
    pub timestamp_ms: u64,
    /// Beats per minute
    pub heart_rate: f64,
}

impl From<&HistoricalDataPacket> for AnalysedDataPoint {
    fn from(packet: &HistoricalDataPacket) -> Self {
        Self {
            timestamp_ms: packet.timestamp_ms,
            heart_rate: f64::from(packet.heart_rate),
        }
    }
}

/// Derived heart rate series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysedDataResult {
    /// Mean over trailing one-minute windows, every minute
    pub hr_avg_1min: Vec<AnalysedDataPoint>,
    /// Mean over trailing two-minute windows, every two minutes
    pub hr_avg_2min: Vec<AnalysedDataPoint>,
    /// Mean over trailing five-minute windows, every five minutes
    pub hr_avg_5min: Vec<AnalysedDataPoint>,
    /// Minimum five-minute average over the trailing 24 hours, every five
    /// minutes, starting once 24 hours of averages exist
    pub rhr_24h: Vec<AnalysedDataPoint>,
}

impl AnalysedDataResult {
    /// Whether every series is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hr_avg_1min.is_empty()
            && self.hr_avg_2min.is_empty()
            && self.hr_avg_5min.is_empty()
            && self.rhr_24h.is_empty()
    }
}

/// Compute the rolling averages and the 24 hour resting heart rate.
///
/// Input order does not matter.
#[must_use]
pub fn analyse_data(samples: &[AnalysedDataPoint]) -> AnalysedDataResult {
    if samples.is_empty() {
        return AnalysedDataResult::default();
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by_key(|p| p.timestamp_ms);
    let series = SortedSeries::new(&sorted);

    let hr_avg_1min = series.moving_average(MS_1MIN, MS_1MIN);
    let hr_avg_2min = series.moving_average(MS_2MIN, MS_2MIN);
    let hr_avg_5min = series.moving_average(MS_5MIN, MS_5MIN);
    let rhr_24h = minimum_over_window(&hr_avg_5min, MS_24H, MS_5MIN);

    AnalysedDataResult {
        hr_avg_1min,
        hr_avg_2min,
        hr_avg_5min,
        rhr_24h,
    }
}

/// Timestamps plus prefix sums of a time-sorted series
struct SortedSeries {
    times: Vec<u64>,
    prefix: Vec<f64>,
}

impl SortedSeries {
    fn new(sorted: &[AnalysedDataPoint]) -> Self {
        let times = sorted.iter().map(|p| p.timestamp_ms).collect();
        let mut prefix = Vec::with_capacity(sorted.len() + 1);
        prefix.push(0.0);
        let mut sum = 0.0;
        for point in sorted {
            sum += point.heart_rate;
            prefix.push(sum);
        }
        Self { times, prefix }
    }

    fn moving_average(&self, window_ms: u64, stride_ms: u64) -> Vec<AnalysedDataPoint> {
        let (Some(&first), Some(&last)) = (self.times.first(), self.times.last()) else {
            return Vec::new();
        };

        grid(first, last, stride_ms)
            .filter_map(|t| {
                let (start, end) = window_bounds(&self.times, t, window_ms);
                (start < end).then(|| AnalysedDataPoint {
                    timestamp_ms: t,
                    heart_rate: (self.prefix[end] - self.prefix[start]) / (end - start) as f64,
                })
            })
            .collect()
    }
}

fn minimum_over_window(
    source: &[AnalysedDataPoint],
    window_ms: u64,
    stride_ms: u64,
) -> Vec<AnalysedDataPoint> {
    let (Some(first), Some(last)) = (source.first(), source.last()) else {
        return Vec::new();
    };
    let times: Vec<u64> = source.iter().map(|p| p.timestamp_ms).collect();

    // Only start once a full window of history exists
    grid(
        first.timestamp_ms.saturating_add(window_ms),
        last.timestamp_ms,
        stride_ms,
    )
        .filter_map(|t| {
            let (start, end) = window_bounds(&times, t, window_ms);
            source[start..end]
                .iter()
                .map(|p| p.heart_rate)
                .reduce(f64::min)
                .map(|heart_rate| AnalysedDataPoint {
                    timestamp_ms: t,
                    heart_rate,
                })
        })
        .collect()
}

/// Multiples of `stride_ms` from the first one at or after `from` up to `to`
fn grid(from: u64, to: u64, stride_ms: u64) -> impl Iterator<Item = u64> {
    let step = usize::try_from(stride_ms).unwrap_or(usize::MAX);
    // No boundary left below u64::MAX means an empty grid
    from.div_ceil(stride_ms)
        .checked_mul(stride_ms)
        .into_iter()
        .flat_map(move |start| (start..=to).step_by(step))
}

/// Index range of the timestamps in `(t - window_ms, t]`
fn window_bounds(times: &[u64], t: u64, window_ms: u64) -> (usize, usize) {
    let start = t
        .checked_sub(window_ms)
        .map_or(0, |floor| times.partition_point(|&x| x <= floor));
    let end = times.partition_point(|&x| x <= t);
    (start, end)
}
