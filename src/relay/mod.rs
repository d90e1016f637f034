//! The fallback relay: chunked file ingestion with optional streaming
//! compression, a metadata table independent of the room registry, and
//! streamed egress with on-the-fly decompression.

mod routes;
mod store;

pub use routes::relay_router;
pub use store::{spawn_janitor, FileMetadata, RelayStore};
