//! Rate-limited warnings for conditions hit on hot paths.
//!
//! The first occurrence of a key logs at WARN; later occurrences drop to
//! DEBUG so a misconfigured workload does not flood the log on every enqueue.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

static WARNED_KEYS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn warned_keys() -> &'static Mutex<HashSet<String>> {
    WARNED_KEYS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Log `message` at WARN the first time `key` is seen, at DEBUG afterwards.
///
/// Returns `true` when this call produced the WARN-level record.
pub fn warn_once_fn(key: &str, message: &str) -> bool {
    let mut seen = match warned_keys().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if seen.insert(key.to_string()) {
        tracing::warn!(key = %key, "{message}");
        true
    } else {
        tracing::debug!(key = %key, "(rate-limited) {message}");
        false
    }
}

/// `warn_once!(key, fmt, args...)`.
#[macro_export]
macro_rules! warn_once {
    ($key:expr, $($arg:tt)*) => {
        $crate::logging::warn_once_fn($key, &format!($($arg)*))
    };
}

#[cfg(test)]
fn forget_key(key: &str) {
    let mut seen = match warned_keys().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    seen.remove(key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .with_test_writer()
            .try_init();
    }

    #[test]
    #[serial(warn_once)]
    fn first_occurrence_warns_then_rate_limits() {
        init_test_tracing();
        forget_key("logging-test-a");
        assert!(warn_once_fn("logging-test-a", "first"));
        assert!(!warn_once_fn("logging-test-a", "second"));
        assert!(!crate::warn_once!("logging-test-a", "third {}", 3));
    }

    #[test]
    #[serial(warn_once)]
    fn keys_are_independent() {
        forget_key("logging-test-b");
        forget_key("logging-test-c");
        assert!(warn_once_fn("logging-test-b", "b"));
        assert!(warn_once_fn("logging-test-c", "c"));
    }

    #[test]
    #[serial(warn_once)]
    fn concurrent_callers_warn_exactly_once() {
        forget_key("logging-test-threads");
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| warn_once_fn("logging-test-threads", "race")))
            .collect();
        let warned = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|w| *w)
            .count();
        assert_eq!(warned, 1);
    }
}
