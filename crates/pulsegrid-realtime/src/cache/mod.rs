//! Session cache implementations

mod memory;
mod redis;

pub use memory::MemorySessionCache;
pub use self::redis::RedisSessionCache;
