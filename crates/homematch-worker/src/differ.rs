use std::collections::HashSet;

use homematch_core::{Listing, MatchKey};

/// Listings of `profile_id` whose match key is not in `existing`.
///
/// Seen listings are dropped even when their details changed. A listing id
/// repeated within `listings` is kept once, at its first position.
pub fn diff_new_listings(
    profile_id: &str,
    listings: Vec<Listing>,
    existing: &HashSet<MatchKey>,
) -> Vec<Listing> {
    let mut seen = HashSet::new();
    listings
        .into_iter()
        .filter(|listing| {
            let key = MatchKey::new(profile_id, &listing.listing_id);
            !existing.contains(&key) && seen.insert(key)
        })
        .collect()
}
