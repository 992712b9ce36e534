use std::{fmt, fmt::Write, time::Duration};

use hmac::{Hmac, Mac};
use serde::{de, de::Visitor, Deserializer};
use sha2::Sha256;

struct F64Visitor;

impl Visitor<'_> for F64Visitor {
    type Value = f64;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string containing an f64 number")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if s.is_empty() {
            Ok(0.0)
        } else {
            s.parse::<f64>().map_err(de::Error::custom)
        }
    }
}

pub fn from_str_to_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_str(F64Visitor)
}

pub fn sign_hmac_sha256(secret: &str, s: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(s.as_bytes());
    let hash = mac.finalize().into_bytes();
    let mut tmp = String::with_capacity(hash.len() * 2);
    for c in hash {
        write!(&mut tmp, "{c:02x}").unwrap();
    }
    tmp
}

/// Reconnect backoff: starts at `min_delay`, doubles per attempt up to
/// `max_delay`, and is reset explicitly once the session is streaming again.
pub struct ExponentialBackoff {
    min_delay: Duration,
    max_delay: Duration,
    last_delay: Option<Duration>,
    attempts: u64,
}

impl ExponentialBackoff {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
            last_delay: None,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        let delay = match self.last_delay {
            None => self.min_delay,
            Some(last) => last.saturating_mul(2).min(self.max_delay),
        };
        self.last_delay = Some(delay);
        delay
    }

    /// Called on re-entering the streaming state; the attempt counter is
    /// retained for metrics.
    pub fn reset(&mut self) {
        self.last_delay = None;
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ExponentialBackoff;

    #[test]
    fn doubles_to_ceiling() {
        let mut backoff = ExponentialBackoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn reset_returns_to_floor_but_keeps_attempts() {
        let mut backoff = ExponentialBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 2);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn hmac_matches_known_vector() {
        // RFC 4231 test case 2.
        let sig = super::sign_hmac_sha256("Jefe", "what do ya want for nothing?");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
