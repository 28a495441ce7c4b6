// SPDX-License-Identifier: MPL-2.0

//! The on-disk binlog.
//!
//! `<data_path>/binlog/binlog.NNNNNN` files hold concatenated textual
//! records; files rotate on a size threshold and positions are
//! `(index, offset)` pairs with `index` naming a file. There is exactly
//! one writer; readers open private handles.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::pack;
use crate::prelude::*;
use crate::types::BinlogPosition;

const BINLOG_SUBDIR: &str = "binlog";
const BINLOG_FILE_PREFIX: &str = "binlog.";

struct WriterState {
    file: File,
    index: u32,
    offset: u64,
}

pub struct BinlogWriter {
    dir: PathBuf,
    rotate_size: u64,
    state: Mutex<WriterState>,
}

pub fn binlog_file_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{}{:06}", BINLOG_FILE_PREFIX, index))
}

fn scan_file_indexes(dir: &Path) -> Result<Vec<u32>> {
    let mut indexes = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(BINLOG_FILE_PREFIX) else {
            continue;
        };
        if let Ok(index) = suffix.parse::<u32>() {
            indexes.push(index);
        }
    }
    indexes.sort_unstable();
    Ok(indexes)
}

impl BinlogWriter {
    /// Opens (or creates) the binlog directory, truncates any torn tail
    /// off the newest file, and reports the last durable `data_version`.
    pub fn open(data_path: &Path, rotate_size: u64) -> Result<(Self, u64)> {
        let dir = data_path.join(BINLOG_SUBDIR);
        std::fs::create_dir_all(&dir)?;

        let indexes = scan_file_indexes(&dir)?;
        let index = indexes.last().copied().unwrap_or(0);
        let path = binlog_file_path(&dir, index);
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        // Position after the last clean record boundary; a torn tail from
        // a crash mid-append is discarded.
        let mut content = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut content)?;
        let clean_len = match pack::detect_last_record_end(&content) {
            Ok(end) => end,
            Err(_) => 0,
        };
        if clean_len < content.len() {
            warn!(
                "discarding {} torn bytes at tail of {:?}",
                content.len() - clean_len,
                path
            );
            file.set_len(clean_len as u64)?;
        }

        let last_data_version = Self::last_data_version_of(&dir, &indexes, &content[..clean_len])?;
        let writer = Self {
            dir,
            rotate_size,
            state: Mutex::new(WriterState {
                file,
                index,
                offset: clean_len as u64,
            }),
        };
        Ok((writer, last_data_version))
    }

    /// The newest file may be empty after rotation or truncation, in
    /// which case the previous files still hold the latest record.
    fn last_data_version_of(dir: &Path, indexes: &[u32], newest: &[u8]) -> Result<u64> {
        if let Ok((data_version, _)) = pack::detect_record_reverse(newest) {
            return Ok(data_version);
        }
        for index in indexes.iter().rev().skip(1) {
            let content = std::fs::read(binlog_file_path(dir, *index))?;
            if let Ok((data_version, _)) = pack::detect_record_reverse(&content) {
                return Ok(data_version);
            }
        }
        Ok(0)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The position the next append will land at.
    pub fn position(&self) -> BinlogPosition {
        let state = self.state.lock().unwrap();
        BinlogPosition {
            index: state.index,
            offset: state.offset,
        }
    }

    pub fn file_indexes(&self) -> Result<Vec<u32>> {
        scan_file_indexes(&self.dir)
    }

    /// Appends already-packed record bytes, rotating first when the
    /// current file would exceed the rotation threshold.
    pub fn append(&self, bytes: &[u8]) -> Result<BinlogPosition> {
        let mut state = self.state.lock().unwrap();
        if state.offset > 0 && state.offset + bytes.len() as u64 > self.rotate_size {
            let next_index = state.index + 1;
            let path = binlog_file_path(&self.dir, next_index);
            let file = OpenOptions::new()
                .read(true)
                .create(true)
                .append(true)
                .open(&path)?;
            info!("binlog rotates to {:?}", path);
            state.file = file;
            state.index = next_index;
            state.offset = 0;
        }

        state.file.write_all(bytes)?;
        state.file.flush()?;
        state.offset += bytes.len() as u64;
        Ok(BinlogPosition {
            index: state.index,
            offset: state.offset,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::binlog::record::{BinlogRecord, RecordOp, RecordOptions};
    use crate::types::{FullName, MODE_FILE};

    fn packed_record(data_version: u64) -> Vec<u8> {
        let mut record = BinlogRecord::with_fullname(
            RecordOp::Create,
            FullName::new(b"ns", b"/file"),
            7,
        );
        record.inode = 100 + data_version;
        record.data_version = data_version;
        record.timestamp = 1000;
        record.stat.mode = MODE_FILE | 0o644;
        record.options |= RecordOptions::MODE;
        let mut buffer = Vec::new();
        pack::pack_record(&record, &mut buffer).unwrap();
        buffer
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("metadir-writer-test")
            .join(format!("{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn append_and_reopen() {
        let dir = temp_dir("append");
        {
            let (writer, last) = BinlogWriter::open(&dir, 1 << 20).unwrap();
            assert_eq!(last, 0);
            writer.append(&packed_record(1)).unwrap();
            let position = writer.append(&packed_record(2)).unwrap();
            assert_eq!(position.index, 0);
            assert!(position.offset > 0);
        }
        let (writer, last) = BinlogWriter::open(&dir, 1 << 20).unwrap();
        assert_eq!(last, 2);
        assert_eq!(writer.position().index, 0);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = temp_dir("torn");
        let clean_len;
        {
            let (writer, _) = BinlogWriter::open(&dir, 1 << 20).unwrap();
            writer.append(&packed_record(5)).unwrap();
            clean_len = writer.position().offset;
            // A crash mid-append leaves half a record behind.
            writer.append(&packed_record(6)[..20].to_vec()).unwrap();
        }
        let (writer, last) = BinlogWriter::open(&dir, 1 << 20).unwrap();
        assert_eq!(last, 5);
        assert_eq!(writer.position().offset, clean_len);
    }

    #[test]
    fn rotation_by_size() {
        let dir = temp_dir("rotate");
        let record = packed_record(1);
        let (writer, _) = BinlogWriter::open(&dir, (record.len() + 10) as u64).unwrap();
        writer.append(&packed_record(1)).unwrap();
        let position = writer.append(&packed_record(2)).unwrap();
        assert_eq!(position.index, 1);
        assert_eq!(writer.file_indexes().unwrap(), vec![0, 1]);

        // Reopen picks up the newest file and the latest version.
        drop(writer);
        let (writer, last) = BinlogWriter::open(&dir, 1 << 20).unwrap();
        assert_eq!(last, 2);
        assert_eq!(writer.position().index, 1);
    }
}
