/// Version 3 onion services, client side
///
/// Addresses name the service key; everything else (blinded keys, the
/// HSDir ring, descriptors and the rendezvous) follows from it and the
/// consensus.
pub mod address;
pub mod descriptor;
pub mod handshake;
pub mod hsdir;
pub mod keyblind;
pub mod rendezvous;

pub use address::{OnionAddress, OnionAddressError};
pub use descriptor::{HsDescriptor, IntroPoint};
pub use keyblind::ServiceKeys;
pub use rendezvous::OnionServiceClient;
