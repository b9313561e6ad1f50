//! Inode CRUD against the `files` table.
//!
//! Timestamps are stamped with the database clock (`UNIX_TIMESTAMP()`) so
//! every mount agrees on time. All statements are parameterized and routed
//! through the client's retry policy.

use log::error;
use log::warn;
use mysql::Row;
use nix::unistd::getgid;
use nix::unistd::getuid;

use crate::error::FsError;
use crate::store::FileKind;
use crate::store::FileRecord;
use crate::store::Store;
use crate::store::column;
use crate::util;

impl Store {
    /// Inserts a new inode under `parent_id` and returns its file id. The
    /// file-type bit is OR-merged into `mode` if the caller left it out,
    /// and the owner/group are the calling user's names (falling back to
    /// the configured defaults when the id has no host entry).
    pub fn create_file(
        &mut self,
        parent_id: u64,
        name: &str,
        kind: FileKind,
        mode: u16,
        uid: u32,
        gid: u32,
    ) -> Result<u64, FsError> {
        let user = util::username(uid).unwrap_or_else(|| self.default_user.clone());
        let group = util::groupname(gid).unwrap_or_else(|| self.default_group.clone());
        let mode = mode | kind.mode_bits();

        self.db
            .exec(
                "INSERT INTO `files` \
                 (`parent_id`,`name`,`type`,`user`,`group`,`mode`,`size`,\
                  `created_on`,`last_accessed_on`,`last_modified_on`,`last_status_changed_on`) \
                 VALUES (?,?,?,?,?,?,0,\
                  UNIX_TIMESTAMP(),UNIX_TIMESTAMP(),UNIX_TIMESTAMP(),UNIX_TIMESTAMP())",
                (parent_id, name, kind.as_str(), user, group, mode),
            )
            .map_err(|err| {
                error!("error creating file '{name}' with parent id {parent_id}: {err}");
                FsError::from(err)
            })?;

        Ok(self.db.last_insert_id())
    }

    /// Hard delete. Foreign keys cascade to children and content blocks.
    pub fn delete_file(&mut self, file_id: u64) -> Result<(), FsError> {
        self.db
            .exec("DELETE FROM `files` WHERE `file_id`=?", (file_id,))
            .map_err(|err| {
                error!("error deleting file id {file_id}: {err}");
                FsError::from(err)
            })
    }

    pub fn set_times(&mut self, file_id: u64, atime: i64, mtime: i64) -> Result<(), FsError> {
        self.db
            .exec(
                "UPDATE `files` SET `last_accessed_on`=?,`last_modified_on`=? WHERE `file_id`=?",
                (atime, mtime, file_id),
            )
            .map_err(|err| {
                error!("error updating times for file id {file_id}: {err}");
                FsError::from(err)
            })
    }

    /// Changes the owner and/or group; at least one must be given.
    pub fn chown(
        &mut self,
        file_id: u64,
        user: Option<&str>,
        group: Option<&str>,
    ) -> Result<(), FsError> {
        let result = match (user, group) {
            (Some(user), Some(group)) => self.db.exec(
                "UPDATE `files` SET `user`=?,`group`=? WHERE `file_id`=?",
                (user, group, file_id),
            ),
            (Some(user), None) => self.db.exec(
                "UPDATE `files` SET `user`=? WHERE `file_id`=?",
                (user, file_id),
            ),
            (None, Some(group)) => self.db.exec(
                "UPDATE `files` SET `group`=? WHERE `file_id`=?",
                (group, file_id),
            ),
            (None, None) => return Err(FsError::InvalidArgument),
        };
        result.map_err(|err| {
            error!("error setting owner on file id {file_id}: {err}");
            FsError::from(err)
        })
    }

    pub fn chmod(&mut self, file_id: u64, mode: u16) -> Result<(), FsError> {
        self.db
            .exec(
                "UPDATE `files` SET `mode`=? WHERE `file_id`=?",
                (mode, file_id),
            )
            .map_err(|err| {
                error!("error setting mode {mode:o} on file id {file_id}: {err}");
                FsError::from(err)
            })
    }

    /// Moves an inode to a new parent and name in a single UPDATE.
    pub fn rename_file(
        &mut self,
        file_id: u64,
        new_parent_id: u64,
        new_name: &str,
    ) -> Result<(), FsError> {
        self.db
            .exec(
                "UPDATE `files` SET `parent_id`=?,`name`=? WHERE `file_id`=?",
                (new_parent_id, new_name, file_id),
            )
            .map_err(|err| {
                error!("error renaming file id {file_id} to '{new_name}': {err}");
                FsError::from(err)
            })
    }

    /// Exchanges the (parent_id, name) pairs of two inodes atomically.
    /// (parent_id, name) is unique, so the first row is parked on a
    /// temporary name to keep every UPDATE collision-free.
    pub fn swap_files(&mut self, a: &FileRecord, b: &FileRecord) -> Result<(), FsError> {
        self.db.transaction_begin()?;
        let result = self.swap_steps(a, b);
        self.db.transaction_end(result.is_ok())?;
        if let Err(err) = &result {
            error!(
                "error exchanging file id {} with file id {}: {err}",
                a.file_id, b.file_id
            );
        }
        result
    }

    fn swap_steps(&mut self, a: &FileRecord, b: &FileRecord) -> Result<(), FsError> {
        let parked = format!("myfs.swap.{}", a.file_id);
        self.db.exec(
            "UPDATE `files` SET `parent_id`=?,`name`=? WHERE `file_id`=?",
            (b.parent_id, parked, a.file_id),
        )?;
        self.db.exec(
            "UPDATE `files` SET `parent_id`=?,`name`=? WHERE `file_id`=?",
            (a.parent_id, a.name.as_str(), b.file_id),
        )?;
        self.db.exec(
            "UPDATE `files` SET `name`=? WHERE `file_id`=?",
            (b.name.as_str(), a.file_id),
        )?;
        Ok(())
    }

    /// Fetches an inode by id, with its parent chain attached (the root
    /// has none) and, when asked, a children snapshot ordered by name.
    pub fn query_file(
        &mut self,
        file_id: u64,
        include_children: bool,
    ) -> Result<Option<FileRecord>, FsError> {
        let row = self
            .db
            .select_first(
                "SELECT `file_id`,`parent_id`,`name`,`type`,`user`,`group`,`mode`,`size`,\
                 `created_on`,`last_accessed_on`,`last_modified_on`,`last_status_changed_on` \
                 FROM `files` WHERE `file_id`=?",
                (file_id,),
            )
            .map_err(|err| {
                error!("error getting file id {file_id}: {err}");
                FsError::from(err)
            })?;

        let Some(row) = row else {
            error!("error getting file id {file_id}: not found");
            return Ok(None);
        };

        let mut file = self.record_from_row(&row)?;
        if file.file_id != 0 {
            file.parent = self.query_file(file.parent_id, false)?.map(Box::new);
        }
        if include_children && file.kind == FileKind::Directory {
            file.children = self.children_of(file.file_id)?;
        }
        Ok(Some(file))
    }

    /// Fetches an inode by (parent_id, name). A missing row is silent:
    /// the kernel stats paths speculatively before most operations.
    pub fn query_by_name(
        &mut self,
        parent_id: u64,
        name: &str,
        include_children: bool,
    ) -> Result<Option<FileRecord>, FsError> {
        let row = self
            .db
            .select_first(
                "SELECT `file_id` FROM `files` WHERE `parent_id`=? AND `name`=?",
                (parent_id, name),
            )
            .map_err(|err| {
                error!("error getting file '{name}' with parent id {parent_id}: {err}");
                FsError::from(err)
            })?;

        match row {
            Some(row) => {
                let file_id: u64 = column(&row, 0)?;
                self.query_file(file_id, include_children)
            }
            None => Ok(None),
        }
    }

    fn record_from_row(&mut self, row: &Row) -> Result<FileRecord, FsError> {
        let file_id: u64 = column(row, 0)?;
        let type_name: String = column(row, 3)?;
        let kind = FileKind::parse(&type_name)
            .ok_or_else(|| FsError::Io(format!("file id {file_id} has unknown type '{type_name}'")))?;
        let user: String = column(row, 4)?;
        let group: String = column(row, 5)?;

        let uid = util::user_id(&user)
            .or_else(|| util::user_id(&self.default_user))
            .unwrap_or_else(|| {
                warn!("user '{user}' for file id {file_id} is unknown, using the process's uid");
                getuid().as_raw()
            });
        let gid = util::group_id(&group)
            .or_else(|| util::group_id(&self.default_group))
            .unwrap_or_else(|| {
                warn!("group '{group}' for file id {file_id} is unknown, using the process's gid");
                getgid().as_raw()
            });

        Ok(FileRecord {
            file_id,
            parent_id: column(row, 1)?,
            name: column(row, 2)?,
            kind,
            mode: column(row, 6)?,
            size: column(row, 7)?,
            uid,
            gid,
            created_on: column(row, 8)?,
            atime: column(row, 9)?,
            mtime: column(row, 10)?,
            ctime: column(row, 11)?,
            parent: None,
            children: Vec::new(),
        })
    }

    fn children_of(&mut self, file_id: u64) -> Result<Vec<FileRecord>, FsError> {
        let rows = self
            .db
            .select(
                "SELECT `file_id` FROM `files` \
                 WHERE `parent_id`=? AND `file_id`!=0 ORDER BY `name` ASC",
                (file_id,),
            )
            .map_err(|err| {
                error!("error getting children for file id {file_id}: {err}");
                FsError::from(err)
            })?;

        let mut children = Vec::with_capacity(rows.len());
        for row in rows {
            let child_id: u64 = column(&row, 0)?;
            if let Some(child) = self.query_file(child_id, false)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Total number of inodes, for statfs.
    pub fn num_files(&mut self) -> Result<u64, FsError> {
        let row = self
            .db
            .select_first("SELECT COUNT(*) FROM `files`", ())
            .map_err(|err| {
                error!("error getting the number of files: {err}");
                FsError::from(err)
            })?
            .ok_or_else(|| FsError::Io("no data returned for the file count".to_string()))?;
        column(&row, 0)
    }

    /// Bytes the database uses for this file system, for statfs.
    pub fn space_used(&mut self) -> Result<u64, FsError> {
        let database = self.database.clone();
        let row = self
            .db
            .select_first(
                "SELECT CAST(IFNULL(SUM(`data_length`+`index_length`),0) AS UNSIGNED) \
                 FROM `information_schema`.`tables` WHERE `table_schema`=?",
                (database,),
            )
            .map_err(|err| {
                error!("error getting the space used: {err}");
                FsError::from(err)
            })?
            .ok_or_else(|| FsError::Io("no data returned for the space used".to_string()))?;
        column(&row, 0)
    }

    /// Whether the inode is in the protected set and must not be deleted.
    /// The root is always protected.
    pub fn is_protected(&mut self, file_id: u64) -> Result<bool, FsError> {
        let row = self
            .db
            .select_first(
                "SELECT COUNT(*) FROM `file_protection` WHERE `file_id`=?",
                (file_id,),
            )
            .map_err(FsError::from)?
            .ok_or_else(|| FsError::Io("no data returned for the protection check".to_string()))?;
        let count: u64 = column(&row, 0)?;
        Ok(count > 0)
    }

    /// The inode's cached content length.
    pub fn file_size(&mut self, file_id: u64) -> Result<u64, FsError> {
        let row = self
            .db
            .select_first("SELECT `size` FROM `files` WHERE `file_id`=?", (file_id,))
            .map_err(FsError::from)?
            .ok_or(FsError::NotFound)?;
        column(&row, 0)
    }
}
