//! Feature → bucket attribution
//!
//! `Explainer` is the pluggable capability that turns a record's features into
//! a bucket attribution map. The default `BucketExplainer` sums per-feature
//! contributions into fixed football buckets; unmapped features land in `OTHER`.

use std::collections::HashMap;

use crate::models::{Explain, Features};

pub const OTHER_BUCKET: &str = "OTHER";

pub trait Explainer: Send + Sync {
    /// Must be deterministic: equal inputs give equal outputs.
    fn explain(&self, features: &Features) -> Explain;
}

pub struct BucketExplainer {
    feature_to_bucket: HashMap<String, String>,
}

impl BucketExplainer {
    pub fn new<I, B, F>(buckets: I) -> Self
    where
        I: IntoIterator<Item = (B, Vec<F>)>,
        B: Into<String>,
        F: Into<String>,
    {
        let mut feature_to_bucket = HashMap::new();
        for (bucket, features) in buckets {
            let bucket = bucket.into();
            for feature in features {
                feature_to_bucket
                    .entry(feature.into())
                    .or_insert_with(|| bucket.clone());
            }
        }
        Self { feature_to_bucket }
    }

    pub fn bucket_of(&self, feature: &str) -> &str {
        self.feature_to_bucket
            .get(feature)
            .map(String::as_str)
            .unwrap_or(OTHER_BUCKET)
    }
}

impl Default for BucketExplainer {
    fn default() -> Self {
        Self::new([
            ("QB", vec!["QB_pressure_rate", "QB_scramble_rate"]),
            ("WR", vec!["WR_sep", "WR_yards_after_catch"]),
            ("OL", vec!["OL_win_rate"]),
            ("DEF", vec!["DEF_pressure", "DEF_pass_rush"]),
            ("SITUATION", vec!["score_diff", "time_left"]),
        ])
    }
}

impl Explainer for BucketExplainer {
    fn explain(&self, features: &Features) -> Explain {
        let mut buckets = Explain::new();
        for (name, value) in features {
            if !value.is_finite() {
                continue;
            }
            *buckets.entry(self.bucket_of(name).to_string()).or_insert(0.0) += value;
        }
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bucket_map() {
        let explainer = BucketExplainer::default();
        let features = Features::from([
            ("QB_pressure_rate".to_string(), 0.1),
            ("QB_scramble_rate".to_string(), 0.05),
            ("score_diff".to_string(), -0.2),
            ("kicker_range".to_string(), 0.02),
        ]);

        let explain = explainer.explain(&features);
        assert!((explain["QB"] - 0.15).abs() < 1e-12);
        assert!((explain["SITUATION"] + 0.2).abs() < 1e-12);
        assert!((explain[OTHER_BUCKET] - 0.02).abs() < 1e-12);
        assert!(!explain.contains_key("WR"));
    }

    #[test]
    fn test_non_finite_features_ignored() {
        let explainer = BucketExplainer::default();
        let features = Features::from([("WR_sep".to_string(), f64::NAN)]);
        assert!(explainer.explain(&features).is_empty());
    }
}
