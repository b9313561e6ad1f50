//! The persistent store: inode rows in `files`, content in `file_data`.

use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use mysql::Row;
use mysql::prelude::FromValue;

use crate::db::DbClient;
use crate::error::FsError;
use crate::store::blocks::BLOCK_SIZE;
use crate::util;

pub mod blocks;
pub mod meta;

/// The maximum length of a file name, matching `files.name VARCHAR(64)`.
pub const FILE_NAME_MAX_LEN: usize = 64;

/// FUSE pins the root inode at 1 while the root row is file_id 0, so inode
/// numbers are the row id shifted by one.
pub fn ino_of(file_id: u64) -> u64 {
    file_id + 1
}

/// The inverse of [`ino_of`].
pub fn id_of(ino: u64) -> u64 {
    ino.saturating_sub(1)
}

/// File types persisted in the `files.type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    SoftLink,
}

impl FileKind {
    /// The enum value stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::File => "File",
            FileKind::Directory => "Directory",
            FileKind::SoftLink => "Soft Link",
        }
    }

    pub fn parse(value: &str) -> Option<FileKind> {
        match value {
            "File" => Some(FileKind::File),
            "Directory" => Some(FileKind::Directory),
            "Soft Link" => Some(FileKind::SoftLink),
            _ => None,
        }
    }

    /// The file-type bits merged into a new inode's mode.
    pub(crate) fn mode_bits(self) -> u16 {
        match self {
            FileKind::File => libc::S_IFREG as u16,
            FileKind::Directory => libc::S_IFDIR as u16,
            FileKind::SoftLink => libc::S_IFLNK as u16,
        }
    }
}

impl From<FileKind> for fuser::FileType {
    fn from(kind: FileKind) -> fuser::FileType {
        match kind {
            FileKind::File => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::SoftLink => fuser::FileType::Symlink,
        }
    }
}

/// An inode row hydrated from the database.
///
/// The parent is a detached copy owned by this record, never a shared
/// reference, so descriptor graphs have no cycles. Children are a snapshot
/// taken when the record was queried with `include_children` and are owned
/// the same way.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: u64,
    pub parent_id: u64,
    pub name: String,
    pub kind: FileKind,
    pub mode: u16,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub created_on: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub parent: Option<Box<FileRecord>>,
    pub children: Vec<FileRecord>,
}

impl FileRecord {
    /// The stat attributes the kernel sees for this inode.
    pub fn attr(&self) -> fuser::FileAttr {
        let nlink = match self.kind {
            FileKind::Directory => 2,
            FileKind::File | FileKind::SoftLink => 1,
        };
        fuser::FileAttr {
            ino: ino_of(self.file_id),
            size: self.size,
            blocks: self.size.div_ceil(BLOCK_SIZE),
            atime: system_time(self.atime),
            mtime: system_time(self.mtime),
            ctime: system_time(self.ctime),
            crtime: system_time(self.created_on),
            kind: self.kind.into(),
            perm: self.mode & 0o7777,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE as u32,
            flags: 0,
        }
    }
}

fn system_time(epoch_secs: i64) -> SystemTime {
    if epoch_secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(epoch_secs as u64)
    } else {
        UNIX_EPOCH
    }
}

/// Extracts a typed column, turning index or conversion misses into an
/// io error instead of a panic.
pub(crate) fn column<T: FromValue>(row: &Row, index: usize) -> Result<T, FsError> {
    match row.get_opt::<T, usize>(index) {
        Some(Ok(value)) => Ok(value),
        _ => Err(FsError::Io(format!("malformed row: column {index}"))),
    }
}

/// The store owns the driver's primary database connection plus the
/// defaults used when stored owner/group names do not resolve.
pub struct Store {
    pub(crate) db: DbClient,
    pub(crate) database: String,
    pub(crate) default_user: String,
    pub(crate) default_group: String,
}

impl Store {
    pub fn new(
        db: DbClient,
        database: impl Into<String>,
        default_user: impl Into<String>,
        default_group: impl Into<String>,
    ) -> Store {
        Store {
            db,
            database: database.into(),
            default_user: default_user.into(),
            default_group: default_group.into(),
        }
    }

    /// Resolves an absolute path segment by segment: each step is a
    /// (parent_id, name) lookup seeded at the root row. Nothing is cached;
    /// the kernel's own getattr cadence covers that.
    pub fn resolve_path(
        &mut self,
        path: &str,
        include_children: bool,
    ) -> Result<FileRecord, FsError> {
        let mut file = self
            .query_by_name(0, "", include_children)?
            .ok_or(FsError::NotFound)?;
        for segment in util::segments(path) {
            let parent_id = file.file_id;
            file = self
                .query_by_name(parent_id, segment, include_children)?
                .ok_or(FsError::NotFound)?;
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_round_trip() {
        for kind in [FileKind::File, FileKind::Directory, FileKind::SoftLink] {
            assert_eq!(FileKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FileKind::parse("Invalid"), None);
        assert_eq!(FileKind::SoftLink.as_str(), "Soft Link");
    }

    #[test]
    fn mode_bits_match_the_type() {
        assert_eq!(FileKind::File.mode_bits(), libc::S_IFREG as u16);
        assert_eq!(FileKind::Directory.mode_bits(), libc::S_IFDIR as u16);
        assert_eq!(FileKind::SoftLink.mode_bits(), libc::S_IFLNK as u16);
        // OR-merging is idempotent when the caller already set the bit.
        let mode = 0o644 | FileKind::File.mode_bits();
        assert_eq!(mode | FileKind::File.mode_bits(), mode);
    }

    #[test]
    fn ino_mapping_round_trips() {
        assert_eq!(ino_of(0), 1);
        assert_eq!(id_of(1), 0);
        for file_id in [0u64, 1, 7, 4096] {
            assert_eq!(id_of(ino_of(file_id)), file_id);
        }
    }

    #[test]
    fn attr_translation() {
        let record = FileRecord {
            file_id: 5,
            parent_id: 0,
            name: "f".to_string(),
            kind: FileKind::File,
            mode: FileKind::File.mode_bits() | 0o640,
            size: 5000,
            uid: 1000,
            gid: 1000,
            created_on: 1_700_000_000,
            atime: 1_700_000_001,
            mtime: 1_700_000_002,
            ctime: 1_700_000_003,
            parent: None,
            children: Vec::new(),
        };
        let attr = record.attr();
        assert_eq!(attr.ino, 6);
        assert_eq!(attr.size, 5000);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
    }
}
