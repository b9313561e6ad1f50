//! MyFS keeps a POSIX file system in MariaDB.
//!
//! Inode metadata lives in the `files` table and file content is chunked
//! into fixed-size blocks in `file_data`; a FUSE driver translates kernel
//! callbacks into SQL. The crate is split along those lines: the
//! [`db`] client wraps every query in a bounded retry policy, [`store`]
//! holds the metadata and block engines, [`fs`] maps kernel callbacks onto
//! them, and [`reclaimer`] gives deleted space back to the storage engine
//! from its own thread.

pub mod config;
pub mod db;
pub mod error;
pub mod fs;
pub mod install;
pub mod logger;
pub mod reclaimer;
pub mod store;
pub mod util;

pub use crate::error::FsError;
pub use crate::fs::FILES_OPEN_MAX;
pub use crate::fs::MyFs;
pub use crate::store::FileKind;
pub use crate::store::FileRecord;
pub use crate::store::Store;
pub use crate::store::blocks::BLOCK_SIZE;
