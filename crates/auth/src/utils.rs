use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;

use crate::AuthError;

/// Prefix the transport layer puts in front of presented tokens
pub const BEARER_PREFIX: &str = "Bearer ";

/// Extract the token from an `Authorization` header value
///
/// # Arguments
///
/// * `header` - The raw header value, e.g. `Bearer eyJ...`
///
/// # Returns
///
/// * `Result<&str, AuthError>` - The token with the prefix stripped
pub fn extract_bearer(header: &str) -> Result<&str, AuthError> {
    let token = header
        .strip_prefix(BEARER_PREFIX)
        .ok_or(AuthError::BearerToken)?
        .trim();

    if token.is_empty() {
        return Err(AuthError::BearerToken);
    }

    Ok(token)
}

/// Source of wall-clock time for issuance and expiry checks
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now.trunc_subsecs(0)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc.def").unwrap(), "abc.def");
        assert_eq!(extract_bearer("Bearer   abc  ").unwrap(), "abc");
        assert!(matches!(extract_bearer("abc"), Err(AuthError::BearerToken)));
        assert!(matches!(extract_bearer("Bearer "), Err(AuthError::BearerToken)));
        assert!(matches!(extract_bearer("Basic abc"), Err(AuthError::BearerToken)));
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        let t0 = clock.now();

        clock.advance(chrono::Duration::seconds(90));

        assert_eq!(clock.now() - t0, chrono::Duration::seconds(90));
    }
}
