use std::fs;
use std::time::{Duration, SystemTime};

use camino::Utf8Path;
use tracing::debug;

/// Freshness check against the artifact's modification time.
///
/// A missing artifact always needs fetching. `max_age` of zero means the
/// artifact is never fresh. An unreadable timestamp, or one in the future,
/// counts as stale rather than fresh.
pub fn should_fetch(destination: &Utf8Path, max_age: Duration) -> bool {
    should_fetch_at(destination, max_age, SystemTime::now())
}

pub fn should_fetch_at(destination: &Utf8Path, max_age: Duration, now: SystemTime) -> bool {
    if max_age.is_zero() {
        return true;
    }
    let Ok(metadata) = fs::metadata(destination.as_std_path()) else {
        return true;
    };
    if !metadata.is_file() {
        return true;
    }
    let Ok(modified) = metadata.modified() else {
        return true;
    };
    match now.duration_since(modified) {
        Ok(age) => {
            let stale = age > max_age;
            debug!(path = %destination, age_secs = age.as_secs(), stale, "freshness check");
            stale
        }
        Err(_) => true,
    }
}
