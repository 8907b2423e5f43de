//! Environment abstraction for deterministic testing.
//!
//! Decouples pipeline logic from system resources (monotonic time, wall-clock
//! time, randomness). Production code runs against real system resources; tests
//! use [`test_utils::MockEnv`] with a manually advanced clock.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    ///
    /// Used for gap timers and recovery backoff, which must not jump when the
    /// user changes the system clock.
    fn now(&self) -> Self::Instant;

    /// Seconds since the Unix epoch.
    ///
    /// Used for key creation timestamps and retention decisions, which must
    /// survive process restarts.
    fn wall_clock_secs(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code (recovery backoff, schedulers) sleeps; pipeline logic
    /// never does.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    ///
    /// Useful for message and conversation ids.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}

/// Test environment with a manually advanced clock.
pub mod test_utils {
    use std::{
        sync::{Arc, Mutex, PoisonError},
        time::{Duration, Instant},
    };

    use rand::{RngCore, SeedableRng, rngs::StdRng};

    use super::Environment;

    /// Deterministic environment for tests.
    ///
    /// Clones share the same clock and RNG. `sleep` advances the clock by the
    /// requested duration and returns immediately, so backoff loops run
    /// instantly while still observing elapsed time.
    #[derive(Clone)]
    pub struct MockEnv {
        state: Arc<Mutex<MockState>>,
    }

    struct MockState {
        base: Instant,
        elapsed: Duration,
        wall_start_secs: u64,
        rng: StdRng,
    }

    impl MockEnv {
        /// Environment with a fixed seed and a wall clock starting at
        /// `1_700_000_000`.
        pub fn new() -> Self {
            Self::with_seed(0x5EED)
        }

        /// Environment with the given RNG seed.
        pub fn with_seed(seed: u64) -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState {
                    base: Instant::now(),
                    elapsed: Duration::ZERO,
                    wall_start_secs: 1_700_000_000,
                    rng: StdRng::seed_from_u64(seed),
                })),
            }
        }

        /// Environment whose RNG is seeded from the OS.
        ///
        /// MLS key generation needs real entropy to produce distinct members.
        pub fn with_crypto_rng() -> Self {
            Self::with_seed(rand::rngs::OsRng.next_u64())
        }

        /// Move both clocks forward.
        pub fn advance(&self, duration: Duration) {
            self.lock().elapsed += duration;
        }

        /// Total time advanced since creation.
        pub fn elapsed(&self) -> Duration {
            self.lock().elapsed
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Environment for MockEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            let state = self.lock();
            state.base + state.elapsed
        }

        fn wall_clock_secs(&self) -> u64 {
            let state = self.lock();
            state.wall_start_secs + state.elapsed.as_secs()
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            self.advance(duration);
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.lock().rng.fill_bytes(buffer);
        }
    }

}
