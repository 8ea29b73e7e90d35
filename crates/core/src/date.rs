//! Business-date clusters.
//!
//! Dates close enough together are loaded with a single range query instead
//! of one query per date.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// An immutable, sorted group of business dates loaded together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateCluster {
    dates: Vec<NaiveDate>,
}

impl DateCluster {
    pub fn new(mut dates: Vec<NaiveDate>) -> Self {
        dates.sort();
        Self { dates }
    }

    pub fn single(date: NaiveDate) -> Self {
        Self { dates: vec![date] }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn start(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn end(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// Apply a per-date transformation (e.g. shift to period end).
    pub fn shifted(&self, shift: impl Fn(NaiveDate) -> NaiveDate) -> DateCluster {
        DateCluster::new(self.dates.iter().map(|d| shift(*d)).collect())
    }
}

impl fmt::Display for DateCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start(), self.end()) {
            (Some(start), Some(end)) if start == end => write!(f, "{}", start),
            (Some(start), Some(end)) => write!(f, "{}..{} ({} dates)", start, end, self.len()),
            _ => write!(f, "no dates"),
        }
    }
}

/// One cluster per date, in date order.
pub fn create_single_date_clusters(dates: &[NaiveDate]) -> Vec<DateCluster> {
    let mut sorted = dates.to_vec();
    sorted.sort();
    sorted.into_iter().map(DateCluster::single).collect()
}

/// Group sorted dates into clusters; a gap above `max_gap_days` starts a new cluster.
pub fn create_multi_date_clusters(dates: &[NaiveDate], max_gap_days: i64) -> Vec<DateCluster> {
    let mut sorted = dates.to_vec();
    sorted.sort();

    let mut clusters = Vec::new();
    let mut current: Vec<NaiveDate> = Vec::new();
    for date in sorted {
        if let Some(last) = current.last() {
            if (date - *last).num_days() > max_gap_days {
                clusters.push(DateCluster::new(std::mem::take(&mut current)));
            }
        }
        current.push(date);
    }
    if !current.is_empty() {
        clusters.push(DateCluster::new(current));
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn flatten(clusters: &[DateCluster]) -> Vec<NaiveDate> {
        clusters.iter().flat_map(|c| c.dates().to_vec()).collect()
    }

    #[test]
    fn empty_input_gives_no_clusters() {
        assert!(create_single_date_clusters(&[]).is_empty());
        assert!(create_multi_date_clusters(&[], 5).is_empty());
    }

    #[test]
    fn single_date_gives_single_cluster() {
        let date = d(2010, 10, 30);
        let single = create_single_date_clusters(&[date]);
        let multi = create_multi_date_clusters(&[date], 5);
        assert_eq!(single, vec![DateCluster::single(date)]);
        assert_eq!(multi, vec![DateCluster::single(date)]);
    }

    #[test]
    fn close_dates_share_a_cluster() {
        let dates = [d(2010, 10, 1), d(2010, 10, 4), d(2010, 10, 9), d(2010, 10, 20)];
        let clusters = create_multi_date_clusters(&dates, 5);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 3);
        assert_eq!(clusters[1].dates(), &[d(2010, 10, 20)]);
    }

    #[test]
    fn flattening_reproduces_sorted_input() {
        let dates = [d(2011, 1, 3), d(2010, 12, 31), d(2011, 1, 3), d(2011, 3, 1), d(2010, 12, 1)];
        let mut sorted = dates.to_vec();
        sorted.sort();

        assert_eq!(flatten(&create_multi_date_clusters(&dates, 5)), sorted);
        assert_eq!(flatten(&create_single_date_clusters(&dates)), sorted);
    }

    #[test]
    fn zero_gap_only_merges_identical_dates() {
        let dates = [d(2010, 1, 1), d(2010, 1, 1), d(2010, 1, 2)];
        let clusters = create_multi_date_clusters(&dates, 0);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn shifted_keeps_order() {
        let cluster = DateCluster::new(vec![d(2010, 1, 31), d(2010, 1, 1)]);
        let shifted = cluster.shifted(|date| date + chrono::Duration::days(1));
        assert_eq!(shifted.dates(), &[d(2010, 1, 2), d(2010, 2, 1)]);
    }
}
