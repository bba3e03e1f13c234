pub mod pool;
pub mod ring;

pub use pool::{BufferPool, PoolStats, PooledBuffer, SharedBufferPool};
pub use ring::{PacketRing, WriteOutcome};
