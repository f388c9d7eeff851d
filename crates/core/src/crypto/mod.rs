/// Cryptographic capabilities shared by the directory, circuit and onion
/// service layers: injectable randomness and hashing helpers.
pub mod hash;
pub mod random;

pub use random::{random_array, OsRandom, SecureRandom};
