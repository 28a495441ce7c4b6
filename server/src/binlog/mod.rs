// SPDX-License-Identifier: MPL-2.0

//! Everything binlog: the record codec, the on-disk log, the producer,
//! the disk reader, replay, and the master-side replication engine.

pub mod pack;
pub mod producer;
pub mod push_result;
pub mod reader;
pub mod record;
pub mod replay;
pub mod replication;
pub mod writer;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::context::ServerContext;
use crate::prelude::*;
use replay::ReplayContext;
use writer::binlog_file_path;

/// Replays the whole on-disk binlog into a fresh store at startup,
/// seeding `data_version` and the inode generator.
pub fn binlog_load(ctx: &Arc<ServerContext>) -> Result<()> {
    let writer = ctx.producer.writer();
    let replay = ReplayContext::new();
    let chunk_size = pack::RECORD_MAX_SIZE * 2;

    for index in writer.file_indexes()? {
        let path = binlog_file_path(writer.dir(), index);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(0))?;

        let mut carry: Vec<u8> = Vec::new();
        loop {
            let mut chunk = carry.clone();
            let carried = chunk.len();
            chunk.resize(carried + chunk_size, 0);
            let read = file.read(&mut chunk[carried..])?;
            chunk.truncate(carried + read);
            if chunk.is_empty() {
                break;
            }

            let clean_len = match pack::detect_last_record_end(&chunk) {
                Ok(end) => end,
                Err(_) if read == 0 => {
                    // A torn tail can only be on the newest file, which
                    // the writer already truncated; anywhere else it is
                    // real corruption.
                    error!("unterminated binlog data in {:?}", path);
                    return_errno!(Errno::EINVAL);
                }
                Err(_) => {
                    carry = chunk;
                    continue;
                }
            };
            carry = chunk.split_off(clean_len);

            replay.deal_buffer(ctx, &chunk)?;
            let counters = replay.counters();
            if counters.fail_count > 0 {
                error!(
                    "binlog load fail in {:?}, {} records failed",
                    path, counters.fail_count
                );
                return Err(Error::new(counters.last_errno.unwrap_or(Errno::EINVAL)));
            }
            if read == 0 && carry.is_empty() {
                break;
            }
        }
        if !carry.is_empty() {
            error!("unterminated binlog data in {:?}", path);
            return_errno!(Errno::EINVAL);
        }
    }

    let counters = replay.counters();
    info!(
        "binlog load done: {} records, {} skipped, data_version: {}",
        counters.record_count,
        counters.skip_count,
        ctx.current_data_version()
    );
    Ok(())
}
