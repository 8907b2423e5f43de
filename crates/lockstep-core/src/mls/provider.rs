//! `OpenMLS` provider for one member's conversation groups.
//!
//! Group state (tree, ratchets, pending proposals) stays in OpenMLS's
//! in-memory store and dies with the process. The only MLS output this crate
//! keeps is the exported epoch secret, which the retention engine stores and
//! later expires. Randomness is drawn from the [`Environment`], so a seeded
//! `MockEnv` produces the same key packages and commits on every run.

use openmls_memory_storage::MemoryStorage;
use openmls_rust_crypto::RustCrypto;
use openmls_traits::{OpenMlsProvider, random::OpenMlsRand};

use crate::{env::Environment, message::MemberId};

/// Crypto, randomness and group-state storage for one local member.
pub struct MlsProvider<E: Environment> {
    member_id: MemberId,
    crypto: RustCrypto,
    rand: EnvRand<E>,
    group_state: MemoryStorage,
}

impl<E: Environment> MlsProvider<E> {
    /// Provider for `member_id`, drawing randomness from `env`.
    pub fn new(env: E, member_id: MemberId) -> Self {
        Self {
            member_id,
            crypto: RustCrypto::default(),
            rand: EnvRand(env),
            group_state: MemoryStorage::default(),
        }
    }

    /// Member whose groups this provider serves.
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }
}

/// Environment randomness in the shapes `OpenMLS` and `rand` ask for.
pub struct EnvRand<E: Environment>(E);

impl<E: Environment> EnvRand<E> {
    fn fill<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.0.random_bytes(&mut bytes);
        bytes
    }
}

impl<E: Environment> rand::RngCore for EnvRand<E> {
    fn next_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.fill())
    }

    fn next_u64(&mut self) -> u64 {
        u64::from_le_bytes(self.fill())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.random_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.random_bytes(dest);
        Ok(())
    }
}

impl<E: Environment> rand::CryptoRng for EnvRand<E> {}

impl<E: Environment> OpenMlsRand for EnvRand<E> {
    type Error = std::convert::Infallible;

    fn random_array<const N: usize>(&self) -> Result<[u8; N], Self::Error> {
        Ok(self.fill())
    }

    fn random_vec(&self, len: usize) -> Result<Vec<u8>, Self::Error> {
        let mut bytes = vec![0u8; len];
        self.0.random_bytes(&mut bytes);
        Ok(bytes)
    }
}

impl<E: Environment> OpenMlsProvider for MlsProvider<E> {
    type CryptoProvider = RustCrypto;
    type RandProvider = EnvRand<E>;
    type StorageProvider = MemoryStorage;

    fn crypto(&self) -> &Self::CryptoProvider {
        &self.crypto
    }

    fn rand(&self) -> &Self::RandProvider {
        &self.rand
    }

    fn storage(&self) -> &Self::StorageProvider {
        &self.group_state
    }
}
