//! Parallel block transfer of one large file over many TCP connections
//!
//! A listening collector pulls block indices from a shared pending queue
//! across every connection a supplier opens at it. Blocks are verified
//! one by one and written positionally, so a lost connection costs a
//! retransmit, never corruption.

pub mod blocks;
pub mod cipher;
pub mod collector;
pub mod error;
pub mod prealloc;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod supplier;
