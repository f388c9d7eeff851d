/// Application streams over a built circuit
mod multiplexer;
mod target;
mod tor_stream;

pub use multiplexer::{AppStream, OnionResolver, StreamMultiplexer};
pub use target::{HttpTarget, StreamTarget};
pub use tor_stream::TorStream;

