// SPDX-License-Identifier: MPL-2.0

//! The binlog producer.
//!
//! Mutations accepted by the data threads are packed into shared record
//! buffers, appended to the binlog file, and fanned out to every live
//! slave queue. The sequencer mutex makes version assignment, the pack,
//! the disk append, and the queue hand-off one atomic step, so binlog
//! order always equals `data_version` order even with several service
//! threads racing.

use super::pack;
use super::record::BinlogRecord;
use super::replication::SlaveLink;
use crate::clock;
use crate::data_thread::RecordOrigin;
use crate::prelude::*;
use crate::binlog::writer::BinlogWriter;

/// One packed record, reference-shared by all slave queues; dropping the
/// last reference frees the bytes.
pub struct RecordBuffer {
    pub data_version: u64,
    pub bytes: Vec<u8>,
    pub origin: Option<RecordOrigin>,
}

pub struct BinlogProducer {
    writer: Arc<BinlogWriter>,
    links: RwLock<Vec<Arc<SlaveLink>>>,
    sequencer: Mutex<()>,
}

impl BinlogProducer {
    pub fn new(writer: Arc<BinlogWriter>) -> Self {
        Self {
            writer,
            links: RwLock::new(Vec::new()),
            sequencer: Mutex::new(()),
        }
    }

    pub fn writer(&self) -> &Arc<BinlogWriter> {
        &self.writer
    }

    pub fn set_links(&self, links: Vec<Arc<SlaveLink>>) {
        *self.links.write().unwrap() = links;
    }

    pub fn links(&self) -> Vec<Arc<SlaveLink>> {
        self.links.read().unwrap().clone()
    }

    pub fn clear_links(&self) {
        self.links.write().unwrap().clear();
    }

    /// Assigns the next `data_version`, stamps and packs the record,
    /// appends it to the binlog, and enqueues the buffer for every slave.
    ///
    /// Once this returns, the mutation is durable on the master and
    /// queued for replication; that is the point the client may be
    /// answered.
    pub fn produce(
        &self,
        data_version: &AtomicU64,
        record: &mut BinlogRecord,
        origin: Option<RecordOrigin>,
    ) -> Result<u64> {
        let _sequencer = self.sequencer.lock().unwrap();

        // The version only becomes visible after a successful pack, so a
        // rejected record leaves no hole in the sequence.
        let next_version = data_version.load(Ordering::SeqCst) + 1;
        record.data_version = next_version;
        record.timestamp = clock::current_time_secs();

        let mut bytes = Vec::with_capacity(512);
        pack::pack_record(record, &mut bytes)?;
        self.writer.append(&bytes)?;
        data_version.store(next_version, Ordering::SeqCst);

        let links = self.links.read().unwrap();
        if !links.is_empty() {
            let buffer = Arc::new(RecordBuffer {
                data_version: next_version,
                bytes,
                origin,
            });
            for link in links.iter() {
                link.enqueue(buffer.clone());
            }
        }
        Ok(next_version)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::binlog::pack;
    use crate::binlog::record::{BinlogRecord, RecordOp, RecordOptions};
    use crate::types::{FullName, MODE_FILE};

    #[test]
    fn racing_producers_emit_strictly_increasing_versions() {
        let dir = std::env::temp_dir()
            .join("metadir-producer-test")
            .join(std::process::id().to_string());
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let (writer, _) = BinlogWriter::open(&dir, 1 << 30).unwrap();
        let producer = Arc::new(BinlogProducer::new(Arc::new(writer)));
        let data_version = Arc::new(AtomicU64::new(0));

        let mut threads = Vec::new();
        for thread_index in 0..4u64 {
            let producer = producer.clone();
            let data_version = data_version.clone();
            threads.push(std::thread::spawn(move || {
                for n in 0..50u64 {
                    let mut record = BinlogRecord::with_fullname(
                        RecordOp::Create,
                        FullName::new(b"ns", b"/f"),
                        thread_index as u32,
                    );
                    record.inode = thread_index * 1000 + n + 1;
                    record.stat.mode = MODE_FILE | 0o644;
                    record.options |= RecordOptions::MODE;
                    producer
                        .produce(&data_version, &mut record, None)
                        .unwrap();
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(data_version.load(Ordering::SeqCst), 200);

        // The emitted binlog carries versions 1..=200 in file order.
        let content = std::fs::read(
            crate::binlog::writer::binlog_file_path(producer.writer().dir(), 0),
        )
        .unwrap();
        let mut expected = 0u64;
        let mut offset = 0;
        while offset < content.len() {
            let (record, end) = pack::unpack_record(&content[offset..]).unwrap();
            expected += 1;
            assert_eq!(record.data_version, expected);
            offset += end;
        }
        assert_eq!(expected, 200);
    }
}
