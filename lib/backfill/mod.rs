//! One-shot sweeps over marketplace collections, triggered by an operator.

pub mod normalize_keywords;

pub use normalize_keywords::{
    is_valid_listing_id, run_normalize_keywords, KeywordNormalizer, ListingPageSource,
    ListingUpdater, NormalizeSettings,
};
