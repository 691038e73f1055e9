//! Chain synchronisation engine: downloads headers, bodies and receipts from
//! remote peers and imports them in full or snap mode.

pub mod chain;
pub mod cli;
pub mod logging;
pub mod p2p;
pub mod sim;
pub mod state;
pub mod sync;

#[cfg(test)]
mod test_utils;

pub use sync::{Downloader, SyncError, SyncEvent, SyncMode, SyncProgress};
