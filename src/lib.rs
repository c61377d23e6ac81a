// Core modules for the cinderkv key-value server
pub mod command; // Cmd enum + Executor (verb dispatch, reply production)
pub mod lru; // RecencyList (arena-backed LRU order)
pub mod protocol; // RESP-2 frame decoder + response encoders
pub mod server; // mio readiness loop (accept, read, dispatch, write)
pub mod storage; // Store (bounded-memory map with LRU eviction)

pub use command::{Cmd, Executor};
pub use protocol::{parse_frame, FrameError};
pub use server::Server;
pub use storage::Store;

/// Port the server binds when none is given on the command line.
pub const DEFAULT_PORT: u16 = 9001;

/// Memory budget for the store when none is configured: 1 GiB.
pub const DEFAULT_MAX_MEMORY: usize = 1024 * 1024 * 1024;
