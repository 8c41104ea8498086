//! Compare two users' collections (watched films, lists) by slug.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field used to identify films in scraped records.
pub const DEFAULT_KEY: &str = "film_slug";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonStats {
    pub user1_total: usize,
    pub user2_total: usize,
    pub common_count: usize,
    pub unique_to_user1_count: usize,
    pub unique_to_user2_count: usize,
    /// Share of the union both users have, as a percentage with two decimals.
    pub compatibility_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub user1: String,
    pub user2: String,
    pub statistics: ComparisonStats,
    pub common: Vec<Value>,
    pub unique_to_user1: Vec<Value>,
    pub unique_to_user2: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    pub recommendations_for: String,
    pub based_on: String,
    pub count: usize,
    pub items: Vec<Value>,
}

/// Index items by their `key` field. Items without a non-empty string key
/// are skipped; for duplicate keys the first item wins.
fn index_by<'a>(items: &'a [Value], key: &str) -> BTreeMap<&'a str, &'a Value> {
    let mut index = BTreeMap::new();
    for item in items {
        if let Some(slug) = item.get(key).and_then(Value::as_str) {
            if !slug.is_empty() {
                index.entry(slug).or_insert(item);
            }
        }
    }
    index
}

fn pick<'a, 's: 'a, 'v>(
    slugs: impl Iterator<Item = &'a &'s str>,
    index: &BTreeMap<&'v str, &'v Value>,
) -> Vec<Value> {
    slugs
        .filter_map(|slug| index.get(*slug).map(|item| (*item).clone()))
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Split two collections into common and per-user items. Output lists are
/// ordered by slug.
pub fn compare_collections(
    user1: &str,
    items1: &[Value],
    user2: &str,
    items2: &[Value],
    key: &str,
) -> Comparison {
    let by_slug1 = index_by(items1, key);
    let by_slug2 = index_by(items2, key);

    let slugs1: BTreeSet<&str> = by_slug1.keys().copied().collect();
    let slugs2: BTreeSet<&str> = by_slug2.keys().copied().collect();

    let common = pick(slugs1.intersection(&slugs2), &by_slug1);
    let unique1 = pick(slugs1.difference(&slugs2), &by_slug1);
    let unique2 = pick(slugs2.difference(&slugs1), &by_slug2);

    let union = slugs1.union(&slugs2).count();
    let compatibility = if union > 0 {
        round2(common.len() as f64 / union as f64 * 100.0)
    } else {
        0.0
    };

    Comparison {
        user1: user1.to_string(),
        user2: user2.to_string(),
        statistics: ComparisonStats {
            user1_total: slugs1.len(),
            user2_total: slugs2.len(),
            common_count: common.len(),
            unique_to_user1_count: unique1.len(),
            unique_to_user2_count: unique2.len(),
            compatibility_percentage: compatibility,
        },
        common,
        unique_to_user1: unique1,
        unique_to_user2: unique2,
    }
}

/// Items user2 has that user1 does not.
pub fn recommendations(comparison: &Comparison) -> Recommendations {
    Recommendations {
        recommendations_for: comparison.user1.clone(),
        based_on: comparison.user2.clone(),
        count: comparison.statistics.unique_to_user2_count,
        items: comparison.unique_to_user2.clone(),
    }
}
