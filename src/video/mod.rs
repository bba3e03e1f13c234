//! Compressed video ingest: framed packet ring, buffer pool, decoder feed
//! and output release.

pub mod buffer;
pub mod constants;
pub mod decoder;
pub mod feed;
pub mod format;
pub mod pipeline;
pub mod release;
pub mod worker;

pub use buffer::{BufferPool, PacketRing, PoolStats, PooledBuffer, WriteOutcome};
pub use decoder::{DecoderBackend, EventSink, InputSlot, OutputSlot, VideoDecoder};
pub use feed::FeederState;
pub use format::{FormatDescriptor, Resolution, ResolutionTier, SurfaceId, VideoCodec, VideoFormat};
pub use pipeline::VideoPipeline;
