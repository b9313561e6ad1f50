//! The filesystem core: the open-handle table and the mapping from kernel
//! callbacks to store operations.
//!
//! The kernel addresses files by inode number and open handle. A handle is
//! an index into a fixed table of 128 slots; each occupied slot owns the
//! descriptor resolved at open time (with a children snapshot for
//! directories). Permissions are not evaluated here; the mount uses the
//! kernel's own permission checks.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use fuser::FileAttr;
use fuser::Filesystem;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyStatfs;
use fuser::ReplyWrite;
use fuser::Request;
use fuser::TimeOrNow;
use log::error;
use log::info;
use parking_lot::Mutex;

use crate::error::FsError;
use crate::reclaimer::ReclaimerAction;
use crate::reclaimer::ReclaimerNotifier;
use crate::store::FILE_NAME_MAX_LEN;
use crate::store::FileKind;
use crate::store::FileRecord;
use crate::store::Store;
use crate::store::id_of;
use crate::store::ino_of;
use crate::util;

/// The maximum number of simultaneously open files.
pub const FILES_OPEN_MAX: usize = 128;

/// Attributes are re-queried on every getattr, so the kernel may not cache
/// them.
const TTL: Duration = Duration::new(0, 0);

/// What the rename flags ask for. Only two flag sets are honored; anything
/// else, including no flags at all, is rejected as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenameMode {
    Exchange,
    NoReplace,
}

fn rename_mode(flags: u32) -> Option<RenameMode> {
    if flags == libc::RENAME_EXCHANGE {
        Some(RenameMode::Exchange)
    } else if flags == libc::RENAME_NOREPLACE {
        Some(RenameMode::NoReplace)
    } else {
        None
    }
}

struct OpenFile {
    record: FileRecord,
    /// The handle was opened with O_APPEND; writes always go to the end.
    append: bool,
}

/// Fixed-capacity table of open descriptors. The slot index is the handle
/// the kernel sees.
struct HandleTable {
    slots: Vec<Option<OpenFile>>,
}

impl HandleTable {
    fn new() -> HandleTable {
        HandleTable {
            slots: (0..FILES_OPEN_MAX).map(|_| None).collect(),
        }
    }

    /// First-free-slot scan from 0. Fails when every slot is taken.
    fn insert(&mut self, open: OpenFile) -> Result<u64, FsError> {
        let Some(free) = self.slots.iter().position(Option::is_none) else {
            return Err(FsError::OutOfHandles);
        };
        self.slots[free] = Some(open);
        Ok(free as u64)
    }

    fn get(&self, fh: u64) -> Option<&OpenFile> {
        self.slots.get(fh as usize).and_then(Option::as_ref)
    }

    fn remove(&mut self, fh: u64) -> Option<OpenFile> {
        self.slots.get_mut(fh as usize).and_then(Option::take)
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

pub struct MyFs {
    store: Store,
    handles: Mutex<HandleTable>,
    reclaimer: ReclaimerNotifier,
}

impl MyFs {
    pub fn new(store: Store, reclaimer: ReclaimerNotifier) -> MyFs {
        MyFs {
            store,
            handles: Mutex::new(HandleTable::new()),
            reclaimer,
        }
    }

    fn open_common(
        &mut self,
        ino: u64,
        dir: bool,
        truncate: bool,
        append: bool,
    ) -> Result<u64, FsError> {
        // Fail before touching the database when the table is full.
        if self.handles.lock().slots.iter().all(Option::is_some) {
            error!("error opening inode {ino}: maximum number of files are open");
            return Err(FsError::OutOfHandles);
        }

        // Directories carry a children snapshot for readdir.
        let record = self
            .store
            .query_file(id_of(ino), dir)?
            .ok_or(FsError::NotFound)?;

        if !dir && truncate {
            self.store.truncate(record.file_id, 0)?;
            self.reclaimer.notify(ReclaimerAction::General);
        }

        self.handles.lock().insert(OpenFile { record, append })
    }

    fn open_info(&self, fh: u64) -> Option<(u64, bool)> {
        let handles = self.handles.lock();
        handles.get(fh).map(|open| (open.record.file_id, open.append))
    }

    fn lookup_entry(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr, FsError> {
        let name = name_str(name)?;
        let record = self
            .store
            .query_by_name(id_of(parent), name, false)?
            .ok_or(FsError::NotFound)?;
        Ok(record.attr())
    }

    fn create_entry(
        &mut self,
        uid: u32,
        gid: u32,
        parent: u64,
        name: &OsStr,
        kind: FileKind,
        mode: u16,
    ) -> Result<FileRecord, FsError> {
        let name = name_str(name)?;
        // The parent has to exist before anything is inserted under it.
        self.store
            .query_file(id_of(parent), false)?
            .ok_or(FsError::NotFound)?;

        let file_id = self
            .store
            .create_file(id_of(parent), name, kind, mode, uid, gid)?;
        self.reclaimer.notify(ReclaimerAction::General);

        self.store.query_file(file_id, false)?.ok_or(FsError::NotFound)
    }

    fn remove_entry(&mut self, parent: u64, name: &OsStr, dir: bool) -> Result<(), FsError> {
        let name = name_str(name)?;
        let record = self
            .store
            .query_by_name(id_of(parent), name, dir)?
            .ok_or(FsError::NotFound)?;

        if dir && !record.children.is_empty() {
            return Err(FsError::NotEmpty);
        }
        if self.store.is_protected(record.file_id)? {
            return Err(FsError::PermissionDenied);
        }

        self.store.delete_file(record.file_id)?;
        self.reclaimer.notify(ReclaimerAction::Delete);
        Ok(())
    }

    fn rename_entry(
        &mut self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<(), FsError> {
        let mode = rename_mode(flags).ok_or(FsError::InvalidArgument)?;
        let name = name_str(name)?;
        let new_name = name_str(new_name)?;
        if new_name.len() > FILE_NAME_MAX_LEN {
            return Err(FsError::InvalidArgument);
        }

        let source = self
            .store
            .query_by_name(id_of(parent), name, false)?
            .ok_or(FsError::NotFound)?;

        match mode {
            RenameMode::Exchange => {
                let target = self
                    .store
                    .query_by_name(id_of(new_parent), new_name, false)?
                    .ok_or(FsError::NotFound)?;
                self.store.swap_files(&source, &target)?;
            }
            RenameMode::NoReplace => {
                if self
                    .store
                    .query_by_name(id_of(new_parent), new_name, false)?
                    .is_some()
                {
                    return Err(FsError::Exists);
                }
                self.store
                    .rename_file(source.file_id, id_of(new_parent), new_name)?;
            }
        }
        self.reclaimer.notify(ReclaimerAction::General);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &mut self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr, FsError> {
        let file_id = id_of(ino);
        let current = self
            .store
            .query_file(file_id, false)?
            .ok_or(FsError::NotFound)?;

        if let Some(new_size) = size {
            self.store.truncate(file_id, new_size)?;
            self.reclaimer.notify(ReclaimerAction::General);
        }

        if let Some(mode) = mode {
            if file_id == 0 {
                return Err(FsError::PermissionDenied);
            }
            // The stored mode always carries the file-type bits.
            let mode = (mode & 0o7777) as u16 | current.kind.mode_bits();
            self.store.chmod(file_id, mode)?;
        }

        if uid.is_some() || gid.is_some() {
            if file_id == 0 {
                return Err(FsError::PermissionDenied);
            }
            let user = uid.map(|uid| {
                util::username(uid).unwrap_or_else(|| self.store.default_user.clone())
            });
            let group = gid.map(|gid| {
                util::groupname(gid).unwrap_or_else(|| self.store.default_group.clone())
            });
            self.store.chown(file_id, user.as_deref(), group.as_deref())?;
        }

        if atime.is_some() || mtime.is_some() {
            let atime = atime.map(epoch_secs).unwrap_or(current.atime);
            let mtime = mtime.map(epoch_secs).unwrap_or(current.mtime);
            self.store.set_times(file_id, atime, mtime)?;
        }

        let record = self
            .store
            .query_file(file_id, false)?
            .ok_or(FsError::NotFound)?;
        Ok(record.attr())
    }
}

fn name_str(name: &OsStr) -> Result<&str, FsError> {
    // Names live in a VARCHAR column; reject what it cannot hold.
    let name = name.to_str().ok_or(FsError::InvalidArgument)?;
    if name.len() > FILE_NAME_MAX_LEN {
        return Err(FsError::InvalidArgument);
    }
    Ok(name)
}

fn epoch_secs(time: TimeOrNow) -> i64 {
    match time {
        TimeOrNow::SpecificTime(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_secs() as i64,
            Err(_) => 0,
        },
        TimeOrNow::Now => util::now_epoch(),
    }
}

impl Filesystem for MyFs {
    fn destroy(&mut self) {
        info!("unmounted; releasing open handles");
        self.handles.lock().clear();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.store.query_file(id_of(ino), false) {
            Ok(Some(record)) => reply.attr(&TTL, &record.attr()),
            Ok(None) => reply.error(libc::ENOENT),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.apply_setattr(ino, mode, uid, gid, size, atime, mtime) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self
            .store
            .query_file(id_of(ino), false)
            .and_then(|record| record.ok_or(FsError::NotFound))
            .and_then(|record| {
                if record.kind != FileKind::SoftLink {
                    return Err(FsError::InvalidArgument);
                }
                self.store.read(record.file_id, record.size, 0)
            });
        match result {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let mode = (mode & 0o7777) as u16;
        match self.create_entry(req.uid(), req.gid(), parent, name, FileKind::Directory, mode) {
            Ok(record) => reply.entry(&TTL, &record.attr(), 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_entry(parent, name, false) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_entry(parent, name, true) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self
            .create_entry(req.uid(), req.gid(), parent, link_name, FileKind::SoftLink, 0o777)
            .and_then(|record| {
                // The link target is the symlink's content.
                self.store
                    .append(record.file_id, target.as_os_str().as_bytes())?;
                self.store
                    .query_file(record.file_id, false)?
                    .ok_or(FsError::NotFound)
            });
        match result {
            Ok(record) => reply.entry(&TTL, &record.attr(), 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.rename_entry(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let truncate = flags & libc::O_TRUNC != 0;
        let append = flags & libc::O_APPEND != 0;
        match self.open_common(ino, false, truncate, append) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some((file_id, _)) = self.open_info(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let offset = offset.max(0) as u64;
        let result = self.store.file_size(file_id).and_then(|current| {
            // Clamp to the current size; reads at or past the end are
            // empty, not errors.
            let want = u64::from(size).min(current.saturating_sub(offset));
            if want == 0 {
                return Ok(Vec::new());
            }
            self.store.read(file_id, want, offset)
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some((file_id, append)) = self.open_info(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let offset = offset.max(0) as u64;
        let result = self.store.file_size(file_id).and_then(|current| {
            // Writes at the end (or through an O_APPEND handle) take the
            // append path; everything else splices in place.
            if append || offset == current {
                self.store.append(file_id, data)
            } else {
                self.store.write(file_id, data, offset)
            }
        });
        match result {
            Ok(()) => {
                self.reclaimer.notify(ReclaimerAction::General);
                reply.written(data.len() as u32);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.lock().remove(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.open_common(ino, true, false, false) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let handles = self.handles.lock();
        let Some(open) = handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let dir = &open.record;

        let mut entries: Vec<(u64, fuser::FileType, &str)> =
            Vec::with_capacity(dir.children.len() + 2);
        entries.push((ino_of(dir.file_id), fuser::FileType::Directory, "."));
        entries.push((ino_of(dir.parent_id), fuser::FileType::Directory, ".."));
        for child in &dir.children {
            entries.push((ino_of(child.file_id), child.kind.into(), child.name.as_str()));
        }

        for (index, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            // The offset handed back is the index of the next entry.
            if reply.add(ino, (index + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.handles.lock().remove(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let result = self
            .store
            .num_files()
            .and_then(|files| Ok((files, self.store.space_used()?)));
        match result {
            Ok((files, space)) => {
                reply.statfs(space, 0, 0, files, 0, 1, FILE_NAME_MAX_LEN as u32, 1)
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Existence only; permission checks are the kernel's.
        match self.store.query_file(id_of(ino), false) {
            Ok(Some(_)) => reply.ok(),
            Ok(None) => reply.error(libc::ENOENT),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        // New regular files are created 0640.
        let result = self
            .create_entry(req.uid(), req.gid(), parent, name, FileKind::File, 0o640)
            .and_then(|record| {
                let attr = record.attr();
                let append = flags & libc::O_APPEND != 0;
                let fh = self.handles.lock().insert(OpenFile { record, append })?;
                Ok((attr, fh))
            });
        match result {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(err) => reply.error(err.errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(file_id: u64) -> FileRecord {
        FileRecord {
            file_id,
            parent_id: 0,
            name: format!("f{file_id}"),
            kind: FileKind::File,
            mode: FileKind::File.mode_bits() | 0o640,
            size: 0,
            uid: 0,
            gid: 0,
            created_on: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            parent: None,
            children: Vec::new(),
        }
    }

    fn open_file(file_id: u64) -> OpenFile {
        OpenFile {
            record: record(file_id),
            append: false,
        }
    }

    #[test]
    fn handle_table_fills_to_capacity_and_recovers() {
        let mut table = HandleTable::new();
        for expected in 0..FILES_OPEN_MAX as u64 {
            let fh = table.insert(open_file(expected)).expect("slot available");
            assert_eq!(fh, expected);
        }
        assert_eq!(
            table.insert(open_file(999)).expect_err("table full"),
            FsError::OutOfHandles
        );

        assert!(table.remove(40).is_some());
        assert_eq!(table.insert(open_file(1000)).expect("freed slot"), 40);
    }

    #[test]
    fn handle_table_scans_for_the_first_free_slot() {
        let mut table = HandleTable::new();
        for id in 0..5 {
            table.insert(open_file(id)).expect("insert");
        }
        table.remove(1);
        table.remove(3);
        assert_eq!(table.insert(open_file(10)).expect("insert"), 1);
        assert_eq!(table.insert(open_file(11)).expect("insert"), 3);
    }

    #[test]
    fn handle_table_clear_releases_everything() {
        let mut table = HandleTable::new();
        for id in 0..10 {
            table.insert(open_file(id)).expect("insert");
        }
        table.clear();
        assert!(table.get(0).is_none());
        assert_eq!(table.insert(open_file(42)).expect("insert"), 0);
    }

    #[test]
    fn rename_flags_policy() {
        assert_eq!(rename_mode(libc::RENAME_EXCHANGE), Some(RenameMode::Exchange));
        assert_eq!(rename_mode(libc::RENAME_NOREPLACE), Some(RenameMode::NoReplace));
        // No flags and unsupported combinations are both rejected.
        assert_eq!(rename_mode(0), None);
        assert_eq!(rename_mode(libc::RENAME_EXCHANGE | libc::RENAME_NOREPLACE), None);
        assert_eq!(rename_mode(libc::RENAME_WHITEOUT), None);
    }

    #[test]
    fn names_must_fit_the_column() {
        let ok = OsStr::new("a-regular-name");
        assert!(name_str(ok).is_ok());
        let long = "x".repeat(FILE_NAME_MAX_LEN + 1);
        assert_eq!(
            name_str(OsStr::new(&long)).expect_err("too long"),
            FsError::InvalidArgument
        );
    }
}
