//! Production environment: system clocks, OS randomness, Tokio timers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lockstep_core::env::Environment;

/// Environment backed by the operating system.
///
/// Monotonic time comes from `std::time::Instant`, wall-clock time from
/// `SystemTime`, randomness from getrandom, and sleeping from Tokio.
///
/// # Panics
///
/// `random_bytes` panics if the OS RNG fails. Nonces and MLS key material
/// cannot be produced safely without it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    /// A clock set before 1970 reads as 0, which makes every key look
    /// freshly created rather than expired.
    #[allow(clippy::disallowed_methods)]
    fn wall_clock_secs(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_secs())
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG is available");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_bytes_differ() {
        let env = SystemEnv::new();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        env.random_bytes(&mut a);
        env.random_bytes(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn wall_clock_is_after_2023() {
        assert!(SystemEnv::new().wall_clock_secs() > 1_672_531_200);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_follows_tokio_clock() {
        let env = SystemEnv::new();
        let start = tokio::time::Instant::now();
        env.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
