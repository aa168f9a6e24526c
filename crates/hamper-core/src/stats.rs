//! Database statistics aggregation.
//!
//! Rolls basket snapshots up into totals, averages and two bounded top-K
//! lists (largest and most recently active baskets).

use serde::{Deserialize, Serialize};

/// Short basket summary used for statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketInfo {
    pub name: String,
    /// Current ring size
    pub requests_count: usize,
    /// Requests ever accepted
    pub requests_total_count: u64,
    /// Capture time of the latest request, milliseconds since epoch
    pub last_request_date: i64,
}

/// Aggregated statistics over all baskets in a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub baskets_count: usize,
    pub empty_baskets_count: usize,
    pub requests_count: usize,
    pub requests_total_count: u64,
    pub max_basket_size: u64,
    pub avg_basket_size: u64,
    #[serde(rename = "top_baskets_size")]
    pub top_baskets_by_size: Vec<BasketInfo>,
    #[serde(rename = "top_baskets_recent")]
    pub top_baskets_by_date: Vec<BasketInfo>,
}

impl DatabaseStats {
    /// Fold one basket snapshot into the aggregate, keeping at most `max`
    /// entries in each top list.
    pub fn collect(&mut self, info: &BasketInfo, max: usize) {
        self.baskets_count += 1;
        if info.requests_total_count == 0 {
            self.empty_baskets_count += 1;
        }

        self.requests_count += info.requests_count;
        self.requests_total_count += info.requests_total_count;
        if info.requests_total_count > self.max_basket_size {
            self.max_basket_size = info.requests_total_count;
        }

        collect_top(&mut self.top_baskets_by_size, info, max, |a, b| {
            a.requests_total_count > b.requests_total_count
        });
        collect_top(&mut self.top_baskets_by_date, info, max, |a, b| {
            a.last_request_date > b.last_request_date
        });
    }

    /// Recompute the average basket size over non-empty baskets.
    ///
    /// Integer division; zero when every basket is empty.
    pub fn update_average(&mut self) {
        let non_empty = self.baskets_count - self.empty_baskets_count;
        self.avg_basket_size = if non_empty > 0 {
            self.requests_total_count / non_empty as u64
        } else {
            0
        };
    }
}

/// Insertion-sort a snapshot into a bounded descending list.
///
/// The item lands at the first position where the comparator prefers it;
/// ties keep the earlier-seen entry ahead. When the list is full the tail is
/// dropped, and an item beating nobody is discarded.
fn collect_top<F>(list: &mut Vec<BasketInfo>, info: &BasketInfo, max: usize, greater: F)
where
    F: Fn(&BasketInfo, &BasketInfo) -> bool,
{
    if max == 0 {
        return;
    }
    for i in 0..list.len() {
        if greater(info, &list[i]) {
            list.insert(i, info.clone());
            list.truncate(max);
            return;
        }
    }
    if list.len() < max {
        list.push(info.clone());
    }
}
