// SPDX-License-Identifier: MPL-2.0

//! The per-slave disk reader thread.
//!
//! Streams binlog from a `(index, offset)` start position into a bounded
//! ring of chunk results, each cut at a clean record boundary. End of
//! data is signalled with an `ENOENT` result; the replication engine
//! decides when that means the slave has caught up.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::pack;
use super::writer::{binlog_file_path, BinlogWriter};
use crate::prelude::*;
use crate::types::BinlogPosition;

/// How many chunks may sit decoded but unsent.
const RESULT_RING_SIZE: usize = 4;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ReadResult {
    pub bytes: Vec<u8>,
    pub last_data_version: u64,
    /// `Some(ENOENT)` marks end-of-binlog at the time of reading.
    pub err: Option<Errno>,
}

pub struct BinlogReader {
    rx: mpsc::Receiver<ReadResult>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl BinlogReader {
    pub fn start(
        writer: Arc<BinlogWriter>,
        start: BinlogPosition,
        chunk_size: usize,
    ) -> Self {
        // A chunk must be able to hold the largest possible record.
        let chunk_size = chunk_size.max(pack::RECORD_MAX_SIZE + 2 * pack::RECORD_SIZE_LEN);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(RESULT_RING_SIZE);
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("binlog-reader".into())
            .spawn(move || reader_loop(writer, start, chunk_size, tx, stop_flag))
            .expect("spawn binlog reader");
        Self {
            rx,
            stop,
            thread: Some(thread),
        }
    }

    /// Fetches the next chunk, waiting up to `timeout`.
    pub fn fetch(&self, timeout: Duration) -> Option<ReadResult> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn terminate(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Drain so a blocked send in the reader wakes up.
        while self.rx.try_recv().is_ok() {}
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BinlogReader {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn send_result(
    tx: &mpsc::SyncSender<ReadResult>,
    stop: &AtomicBool,
    mut result: ReadResult,
) -> bool {
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        match tx.try_send(result) {
            Ok(()) => return true,
            Err(mpsc::TrySendError::Full(back)) => {
                result = back;
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(mpsc::TrySendError::Disconnected(_)) => return false,
        }
    }
}

fn reader_loop(
    writer: Arc<BinlogWriter>,
    start: BinlogPosition,
    chunk_size: usize,
    tx: mpsc::SyncSender<ReadResult>,
    stop: Arc<AtomicBool>,
) {
    let mut position = start;
    let mut carry: Vec<u8> = Vec::new();

    while !stop.load(Ordering::SeqCst) {
        let write_position = writer.position();
        let path = binlog_file_path(writer.dir(), position.index);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                error!("open {:?} fail: {}", path, err);
                let _ = send_result(
                    &tx,
                    &stop,
                    ReadResult {
                        bytes: Vec::new(),
                        last_data_version: 0,
                        err: Some(Errno::EIO),
                    },
                );
                return;
            }
        };
        let file_len = match file.metadata() {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        if position.offset >= file_len {
            if position.index < write_position.index {
                // This file is finished; continue with the next one.
                position = BinlogPosition {
                    index: position.index + 1,
                    offset: 0,
                };
                carry.clear();
                continue;
            }
            // Caught up with the writer.
            if !send_result(
                &tx,
                &stop,
                ReadResult {
                    bytes: Vec::new(),
                    last_data_version: 0,
                    err: Some(Errno::ENOENT),
                },
            ) {
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
            continue;
        }

        if file.seek(SeekFrom::Start(position.offset)).is_err() {
            return;
        }
        let want = chunk_size
            .saturating_sub(carry.len())
            .min((file_len - position.offset) as usize);
        let mut chunk = carry.clone();
        chunk.resize(carry.len() + want, 0);
        let carried = carry.len();
        if file.read_exact(&mut chunk[carried..]).is_err() {
            continue;
        }

        // Only ship whole records; hold any partial tail for next round.
        let clean_len = match pack::detect_last_record_end(&chunk) {
            Ok(end) => end,
            Err(_) => 0,
        };
        if clean_len == 0 {
            // A record larger than what we have so far; wait for more.
            carry = chunk;
            position.offset += want as u64;
            std::thread::sleep(POLL_INTERVAL);
            continue;
        }

        let rest = chunk.split_off(clean_len);
        let last_data_version = match pack::detect_record_reverse(&chunk) {
            Ok((data_version, _)) => data_version,
            Err(_) => 0,
        };
        position.offset += want as u64;
        carry = rest;

        if !send_result(
            &tx,
            &stop,
            ReadResult {
                bytes: chunk,
                last_data_version,
                err: None,
            },
        ) {
            return;
        }
    }
}
