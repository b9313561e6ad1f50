//! Chunked file content in the `file_data` table.
//!
//! File bytes are split into blocks of [`BLOCK_SIZE`] bytes, one row per
//! block, densely indexed from 0. Every block but the last is exactly full
//! and the last holds 1 to `BLOCK_SIZE` bytes, so after any mutation the
//! inode's cached `size` equals the sum of block lengths. Each compound
//! mutation runs in a transaction so a crash cannot leave the two out of
//! step.
//!
//! MariaDB string positions are 1-based, which is why every splice adds
//! one to the in-block offset.

use log::error;
use log::warn;

use crate::error::FsError;
use crate::store::Store;
use crate::store::column;

/// The block size in bytes. Must match the `file_data.data` column type,
/// `VARBINARY(4096)`.
pub const BLOCK_SIZE: u64 = 4096;

/// The block containing byte `offset`.
pub fn block_of(offset: u64) -> u64 {
    offset / BLOCK_SIZE
}

/// The position of byte `offset` within its block.
pub fn offset_in(offset: u64) -> u64 {
    offset % BLOCK_SIZE
}

/// How many blocks `length` bytes span, starting at a block boundary.
pub fn blocks_spanned(length: u64) -> u64 {
    length.div_ceil(BLOCK_SIZE)
}

struct TailBlock {
    id: u64,
    index: u64,
    len: u64,
}

impl Store {
    /// Reads up to `size` bytes starting at `offset`. Short reads happen
    /// when the file ends first.
    pub fn read(&mut self, file_id: u64, size: u64, offset: u64) -> Result<Vec<u8>, FsError> {
        self.db.transaction_begin()?;
        let result = self.read_blocks(file_id, size, offset);
        self.db.transaction_end(result.is_ok())?;
        if let Err(err) = &result {
            error!("error reading file id {file_id}: {err}");
        }
        result
    }

    fn read_blocks(&mut self, file_id: u64, size: u64, offset: u64) -> Result<Vec<u8>, FsError> {
        let first = block_of(offset);
        let mut skip = offset_in(offset) as usize;
        let limit = blocks_spanned(size + skip as u64);

        let rows = self.db.select(
            "SELECT `data` FROM `file_data` \
             WHERE `file_id`=? AND `index`>=? ORDER BY `index` ASC LIMIT ?",
            (file_id, first, limit),
        )?;

        let mut out = Vec::with_capacity(size as usize);
        for row in rows {
            let data: Vec<u8> = column(&row, 0)?;
            if skip >= data.len() {
                break;
            }
            let take = (size as usize - out.len()).min(data.len() - skip);
            out.extend_from_slice(&data[skip..skip + take]);
            skip = 0;
            if out.len() >= size as usize {
                break;
            }
        }
        Ok(out)
    }

    /// Writes `data` at an arbitrary `offset`, splicing into the blocks
    /// already there and appending new blocks for whatever is left over.
    pub fn write(&mut self, file_id: u64, data: &[u8], offset: u64) -> Result<(), FsError> {
        self.db.transaction_begin()?;
        let result = self.write_blocks(file_id, data, offset);
        self.db.transaction_end(result.is_ok())?;
        if let Err(err) = &result {
            error!(
                "error writing {} bytes to file id {file_id} at offset {offset}: {err}",
                data.len()
            );
        }
        result
    }

    fn write_blocks(&mut self, file_id: u64, data: &[u8], offset: u64) -> Result<(), FsError> {
        if data.is_empty() {
            return Ok(());
        }
        let first = block_of(offset);
        let mut within = offset_in(offset);
        let limit = blocks_spanned(data.len() as u64 + within);

        let rows = self.db.select(
            "SELECT `file_data_id`,`index`,OCTET_LENGTH(`data`) FROM `file_data` \
             WHERE `file_id`=? AND `index`>=? ORDER BY `index` ASC LIMIT ?",
            (file_id, first, limit),
        )?;

        let mut grown: u64 = 0;
        let mut next_index = first;
        let mut remaining = data;

        for row in rows {
            if remaining.is_empty() {
                break;
            }
            let block_id: u64 = column(&row, 0)?;
            let index: u64 = column(&row, 1)?;
            let len: u64 = column(&row, 2)?;

            let span = remaining.len().min((BLOCK_SIZE - within) as usize);
            // INSERT() replaces `span` bytes in place and keeps the tail of
            // a partially overwritten block.
            self.db.exec(
                "UPDATE `file_data` SET `data`=INSERT(`data`,?,?,?) WHERE `file_data_id`=?",
                (within + 1, span as u64, remaining[..span].to_vec(), block_id),
            )?;

            // A splice that runs past the block's old end grows the file.
            let end = within + span as u64;
            if end > len {
                grown += end - len;
            }

            remaining = &remaining[span..];
            within = 0;
            next_index = index + 1;
        }

        grown += self.insert_blocks(file_id, next_index, remaining)?;

        if grown > 0 {
            self.db.exec(
                "UPDATE `files` SET `size`=`size`+? WHERE `file_id`=?",
                (grown, file_id),
            )?;
        }
        Ok(())
    }

    /// Appends `data` at the end of the file: tops up the last block with
    /// an in-database concat, then inserts full blocks for the rest.
    pub fn append(&mut self, file_id: u64, data: &[u8]) -> Result<(), FsError> {
        self.db.transaction_begin()?;
        let result = self.append_blocks(file_id, data);
        self.db.transaction_end(result.is_ok())?;
        if let Err(err) = &result {
            error!(
                "error appending {} bytes to file id {file_id}: {err}",
                data.len()
            );
        }
        result
    }

    fn append_blocks(&mut self, file_id: u64, data: &[u8]) -> Result<(), FsError> {
        if data.is_empty() {
            return Ok(());
        }
        let tail = self.tail_block(file_id)?;

        self.db.exec(
            "UPDATE `files` SET `size`=`size`+? WHERE `file_id`=?",
            (data.len() as u64, file_id),
        )?;

        let mut remaining = data;
        let mut next_index = 0;
        if let Some(tail) = tail {
            next_index = tail.index + 1;
            if tail.len < BLOCK_SIZE {
                let take = remaining.len().min((BLOCK_SIZE - tail.len) as usize);
                self.db.exec(
                    "UPDATE `file_data` SET `data`=CONCAT(`data`,?) WHERE `file_data_id`=?",
                    (remaining[..take].to_vec(), tail.id),
                )?;
                remaining = &remaining[take..];
            }
        }

        self.insert_blocks(file_id, next_index, remaining)?;
        Ok(())
    }

    /// Sets the file's length, space-padding on grow and dropping or
    /// trimming tail blocks on shrink.
    pub fn truncate(&mut self, file_id: u64, new_size: u64) -> Result<(), FsError> {
        self.db.transaction_begin()?;
        let result = self.truncate_blocks(file_id, new_size);
        self.db.transaction_end(result.is_ok())?;
        if let Err(err) = &result {
            error!("error truncating file id {file_id} to {new_size}: {err}");
        }
        result
    }

    fn truncate_blocks(&mut self, file_id: u64, new_size: u64) -> Result<(), FsError> {
        let size = self.file_size(file_id)?;
        if size == new_size {
            return Ok(());
        }

        self.db.exec(
            "UPDATE `files` SET `size`=? WHERE `file_id`=?",
            (new_size, file_id),
        )?;

        if new_size > size {
            self.grow_blocks(file_id, size, new_size)
        } else {
            self.shrink_blocks(file_id, size, new_size)
        }
    }

    fn grow_blocks(&mut self, file_id: u64, size: u64, new_size: u64) -> Result<(), FsError> {
        let mut needed = new_size - size;
        let mut next_index = 0;

        if let Some(tail) = self.tail_block(file_id)? {
            next_index = tail.index + 1;
            if tail.len < BLOCK_SIZE {
                let pad = needed.min(BLOCK_SIZE - tail.len);
                self.db.exec(
                    "UPDATE `file_data` SET `data`=CONCAT(`data`,REPEAT(' ',?)) \
                     WHERE `file_data_id`=?",
                    (pad, tail.id),
                )?;
                needed -= pad;
            }
        }

        // The pad byte is an ASCII space so grown text files stay readable.
        while needed > 0 {
            let span = needed.min(BLOCK_SIZE);
            self.db.exec(
                "INSERT INTO `file_data` (`file_id`,`index`,`data`) VALUES (?,?,REPEAT(' ',?))",
                (file_id, next_index, span),
            )?;
            needed -= span;
            next_index += 1;
        }
        Ok(())
    }

    fn shrink_blocks(&mut self, file_id: u64, size: u64, new_size: u64) -> Result<(), FsError> {
        let mut remaining = size;
        while remaining > new_size {
            let Some(tail) = self.tail_block(file_id)? else {
                warn!("file id {file_id} ran out of blocks while shrinking to {new_size}");
                break;
            };
            let start = tail.index * BLOCK_SIZE;
            if start >= new_size {
                // The whole block lies above the new end.
                self.db.exec(
                    "DELETE FROM `file_data` WHERE `file_data_id`=?",
                    (tail.id,),
                )?;
                remaining = start;
            } else {
                let keep = new_size - start;
                if keep < tail.len {
                    self.db.exec(
                        "UPDATE `file_data` SET `data`=SUBSTRING(`data`,1,?) \
                         WHERE `file_data_id`=?",
                        (keep, tail.id),
                    )?;
                }
                remaining = new_size;
            }
        }
        Ok(())
    }

    /// Inserts `data` as consecutive whole blocks starting at
    /// `start_index`; returns the number of bytes written.
    fn insert_blocks(
        &mut self,
        file_id: u64,
        start_index: u64,
        data: &[u8],
    ) -> Result<u64, FsError> {
        let mut next_index = start_index;
        let mut remaining = data;
        while !remaining.is_empty() {
            let span = remaining.len().min(BLOCK_SIZE as usize);
            self.db.exec(
                "INSERT INTO `file_data` (`file_id`,`index`,`data`) VALUES (?,?,?)",
                (file_id, next_index, remaining[..span].to_vec()),
            )?;
            next_index += 1;
            remaining = &remaining[span..];
        }
        Ok(data.len() as u64)
    }

    fn tail_block(&mut self, file_id: u64) -> Result<Option<TailBlock>, FsError> {
        let row = self.db.select_first(
            "SELECT `file_data_id`,`index`,OCTET_LENGTH(`data`) FROM `file_data` \
             WHERE `file_id`=? ORDER BY `index` DESC LIMIT 1",
            (file_id,),
        )?;
        match row {
            Some(row) => Ok(Some(TailBlock {
                id: column(&row, 0)?,
                index: column(&row, 1)?,
                len: column(&row, 2)?,
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_math() {
        assert_eq!(block_of(0), 0);
        assert_eq!(block_of(BLOCK_SIZE - 1), 0);
        assert_eq!(block_of(BLOCK_SIZE), 1);
        assert_eq!(offset_in(BLOCK_SIZE - 1), BLOCK_SIZE - 1);
        assert_eq!(offset_in(BLOCK_SIZE), 0);
        assert_eq!(offset_in(BLOCK_SIZE + 5), 5);
    }

    #[test]
    fn blocks_spanned_rounds_up() {
        assert_eq!(blocks_spanned(0), 0);
        assert_eq!(blocks_spanned(1), 1);
        assert_eq!(blocks_spanned(BLOCK_SIZE), 1);
        assert_eq!(blocks_spanned(BLOCK_SIZE + 1), 2);
        assert_eq!(blocks_spanned(3 * BLOCK_SIZE), 3);
    }

    #[test]
    fn window_for_a_straddling_write() {
        // A 10-byte write at offset 4091 touches the last 5 bytes of block
        // 0 and the first 5 of block 1.
        let offset = 4091;
        let len = 10;
        assert_eq!(block_of(offset), 0);
        assert_eq!(offset_in(offset), 4091);
        assert_eq!(blocks_spanned(len + offset_in(offset)), 2);
    }
}
