//! Lock key normalization, lease defaults and holder identities.

use std::time::Duration;

use distributed_lock_core::error::{LockError, LockResult};

/// Lease applied when none (or a non-positive one) is configured.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Key path separator.
const SEPARATOR: char = '/';

/// Validates a lock key and forces it to start with the path separator.
pub fn normalize_key(key: &str) -> LockResult<String> {
    if key.is_empty() {
        return Err(LockError::Configuration(
            "lock key cannot be empty".to_string(),
        ));
    }

    if key.starts_with(SEPARATOR) {
        Ok(key.to_string())
    } else {
        Ok(format!("{SEPARATOR}{key}"))
    }
}

/// Converts a TTL in seconds to a lease, falling back to [`DEFAULT_TTL`]
/// when it is below one second.
pub fn lease_from_secs(ttl: i64) -> Duration {
    if ttl < 1 {
        DEFAULT_TTL
    } else {
        Duration::from_secs(ttl as u64)
    }
}

/// Falls back to [`DEFAULT_TTL`] for leases shorter than one second.
pub fn clamp_lease(ttl: Duration) -> Duration {
    if ttl < Duration::from_secs(1) {
        DEFAULT_TTL
    } else {
        ttl
    }
}

/// Builds the identity stored as the lock value:
/// `{hostname}-{pid}-{YYYYMMDD-HH:MM:SS.nnnnnnnnn}`.
pub fn holder_identity() -> LockResult<String> {
    let host = hostname::get().map_err(LockError::Environment)?;
    let timestamp = chrono::Local::now().format("%Y%m%d-%H:%M:%S%.9f");
    Ok(format!(
        "{}-{}-{}",
        host.to_string_lossy(),
        std::process::id(),
        timestamp
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("mylock").unwrap(), "/mylock");
        assert_eq!(normalize_key("/mylock").unwrap(), "/mylock");
        assert_eq!(normalize_key("locks/a").unwrap(), "/locks/a");
        assert!(matches!(normalize_key(""), Err(LockError::Configuration(_))));
    }

    #[test]
    fn test_lease_defaults() {
        assert_eq!(lease_from_secs(0), DEFAULT_TTL);
        assert_eq!(lease_from_secs(-5), DEFAULT_TTL);
        assert_eq!(lease_from_secs(2), Duration::from_secs(2));
        assert_eq!(clamp_lease(Duration::from_millis(500)), DEFAULT_TTL);
        assert_eq!(clamp_lease(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn test_holder_identity_layout() {
        let id = holder_identity().unwrap();
        let pid = format!("-{}-", std::process::id());
        assert!(id.contains(&pid), "identity {id} is missing the pid");

        let timestamp = id.rsplit_once(&pid).unwrap().1;
        let (date, time) = timestamp.split_once('-').unwrap();
        assert_eq!(date.len(), 8);
        assert!(date.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(time.len(), "15:04:05.000000000".len());
    }
}
