/// Tor link and relay protocol
///
/// Cells, the link handshake, circuit key agreement and relay crypto,
/// assembled into `TorCircuit` and `TorConnector`.
pub mod cell;
pub mod channel;
pub mod circuit;
pub mod handshake;
pub mod relay_crypto;

pub use cell::{Cell, CellCommand, RelayCommand, RelayMessage};
pub use channel::Channel;
pub use circuit::{TorCircuit, TorConnector};
pub use relay_crypto::LayerCrypto;
