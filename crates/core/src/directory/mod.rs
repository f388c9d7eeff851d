/// Directory subsystem: consensus acquisition, the relay registry and
/// relay selection.
pub mod authority;
pub mod consensus;
pub mod criteria;
pub mod descriptor;
pub mod document;
pub mod fetch;
pub mod registry;
pub mod router;
pub mod selector;

pub use authority::{DirectoryAuthority, DEFAULT_AUTHORITIES};
pub use consensus::Consensus;
pub use criteria::SearchCriteria;
pub use descriptor::{DescriptorSource, ServerDescriptor};
pub use document::{ConsensusDocument, ConsensusFlavor};
pub use fetch::{DirectoryFetcher, HttpDirectoryFetcher};
pub use registry::RelayRegistry;
pub use router::{OnionRouter, RouterFlags};
pub use selector::RelaySelector;

use minitor_common::DomainError;

/// Decodes directory base64, which may or may not carry `=` padding
pub fn decode_base64(value: &str) -> Result<Vec<u8>, DomainError> {
    let trimmed = value.trim().trim_end_matches('=');
    data_encoding::BASE64_NOPAD
        .decode(trimmed.as_bytes())
        .map_err(|e| DomainError::InvalidBase64(e.to_string()))
}
