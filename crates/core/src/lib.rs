pub mod circuit;
pub mod client;
pub mod crypto;
pub mod directory;
pub mod protocol;
pub mod service;
pub mod stream;
pub mod transport;

pub use client::TorClient;

// Re-export circuit types
pub use circuit::{CircuitBuilder, CircuitConnector, CircuitState, HopInfo, OnionCircuit};

// Re-export directory types
pub use directory::{
    Consensus, DirectoryFetcher, HttpDirectoryFetcher, OnionRouter, RouterFlags, SearchCriteria,
};

// Re-export protocol types
pub use protocol::{TorCircuit, TorConnector};

// Re-export stream and onion service types
pub use service::{OnionAddress, OnionServiceClient};
pub use stream::{AppStream, HttpTarget, OnionResolver, StreamTarget, TorStream};
pub use transport::{ByteStream, HttpResponse};
