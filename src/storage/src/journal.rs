use std::io::{self, BufWriter, Read, Write};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use log::info;

use crate::compression::{compress_if_needed, decompress};
use crate::types::Position;

/// Binary journal format constants
const JOURNAL_MAGIC: &[u8; 4] = b"QJNL";
const JOURNAL_VERSION: u8 = 1;

/// Record types
const OP_ENQUEUE: u8 = 1;
const OP_DEQUEUE: u8 = 2;

/// Body is LZ4-compressed
const FLAG_COMPRESSED: u8 = 0x01;

/// Header size: magic(4) + version(1) + op(1) + flags(1) + queue_len(2) + position(8) + body_len(4) = 21 bytes
const HEADER_SIZE: usize = 21;
/// CRC32 size
const CRC_SIZE: usize = 4;

/// Journal record for a single queue change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Enqueue {
        queue: String,
        position: Position,
        body: String,
    },
    Dequeue {
        queue: String,
        position: Position,
    },
}

impl JournalEntry {
    /// Encode entry to binary format
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 256);

        buf.extend_from_slice(JOURNAL_MAGIC);
        buf.push(JOURNAL_VERSION);

        match self {
            JournalEntry::Enqueue { queue, position, body } => {
                let queue_bytes = queue.as_bytes();
                let (flags, body_bytes) = match compress_if_needed(body.as_bytes()) {
                    Some(compressed) => (FLAG_COMPRESSED, compressed),
                    None => (0, body.as_bytes().to_vec()),
                };

                buf.push(OP_ENQUEUE);
                buf.push(flags);
                buf.extend_from_slice(&(queue_bytes.len() as u16).to_le_bytes());
                buf.extend_from_slice(&position.get().to_le_bytes());
                buf.extend_from_slice(&(body_bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(queue_bytes);
                buf.extend_from_slice(&body_bytes);
            }
            JournalEntry::Dequeue { queue, position } => {
                let queue_bytes = queue.as_bytes();

                buf.push(OP_DEQUEUE);
                buf.push(0);
                buf.extend_from_slice(&(queue_bytes.len() as u16).to_le_bytes());
                buf.extend_from_slice(&position.get().to_le_bytes());
                buf.extend_from_slice(&0u32.to_le_bytes()); // body_len = 0
                buf.extend_from_slice(queue_bytes);
            }
        }

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        buf
    }

    /// Decode entry from binary format
    fn decode(data: &[u8]) -> io::Result<(Self, usize)> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Entry too short"));
        }

        if &data[0..4] != JOURNAL_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Invalid magic"));
        }

        let version = data[4];
        if version != JOURNAL_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unsupported journal version: {}", version)
            ));
        }

        let op = data[5];
        let flags = data[6];
        let queue_len = u16::from_le_bytes([data[7], data[8]]) as usize;
        let position = u64::from_le_bytes([
            data[9], data[10], data[11], data[12],
            data[13], data[14], data[15], data[16]
        ]);
        let body_len = u32::from_le_bytes([data[17], data[18], data[19], data[20]]) as usize;

        let total_len = HEADER_SIZE + queue_len + body_len + CRC_SIZE;

        if data.len() < total_len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Entry truncated"));
        }

        let stored_crc = u32::from_le_bytes([
            data[total_len - 4],
            data[total_len - 3],
            data[total_len - 2],
            data[total_len - 1],
        ]);
        let calculated_crc = crc32fast::hash(&data[..total_len - CRC_SIZE]);

        if stored_crc != calculated_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("CRC mismatch: stored={}, calculated={}", stored_crc, calculated_crc)
            ));
        }

        let mut offset = HEADER_SIZE;

        let queue = String::from_utf8_lossy(&data[offset..offset + queue_len]).to_string();
        offset += queue_len;

        let entry = match op {
            OP_ENQUEUE => {
                let raw = &data[offset..offset + body_len];
                let body = if flags & FLAG_COMPRESSED != 0 {
                    let bytes = decompress(raw)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    String::from_utf8_lossy(&bytes).to_string()
                } else {
                    String::from_utf8_lossy(raw).to_string()
                };
                JournalEntry::Enqueue {
                    queue,
                    position: Position(position),
                    body,
                }
            }
            OP_DEQUEUE => JournalEntry::Dequeue {
                queue,
                position: Position(position),
            },
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Unknown operation: {}", op)
                ));
            }
        };

        Ok((entry, total_len))
    }
}

/// Append-only journal for one queue
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Journal {
    /// Open (or create) the journal at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        info!("Journal opened at {:?} (binary format v{})", path, JOURNAL_VERSION);

        Ok(Journal {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn log_enqueue(&mut self, queue: &str, position: Position, body: &str) -> io::Result<()> {
        let entry = JournalEntry::Enqueue {
            queue: queue.to_string(),
            position,
            body: body.to_string(),
        };
        self.append(&entry)
    }

    pub fn log_dequeue(&mut self, queue: &str, position: Position) -> io::Result<()> {
        let entry = JournalEntry::Dequeue {
            queue: queue.to_string(),
            position,
        };
        self.append(&entry)
    }

    /// Enqueues are flushed immediately: a message is never acknowledged
    /// before its record reaches the file.
    fn append(&mut self, entry: &JournalEntry) -> io::Result<()> {
        self.writer.write_all(&entry.encode())?;
        self.writer.flush()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    /// Read all entries from the journal file
    pub fn read_entries(&self) -> io::Result<Vec<JournalEntry>> {
        read_entries(&self.path)
    }

    /// Close the journal and delete its file
    pub fn remove(mut self) -> io::Result<()> {
        self.writer.flush()?;
        drop(self.writer);
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every decodable entry from a journal file, skipping corrupted records.
pub fn read_entries(path: &Path) -> io::Result<Vec<JournalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut entries = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        match JournalEntry::decode(&data[offset..]) {
            Ok((entry, consumed)) => {
                entries.push(entry);
                offset += consumed;
            }
            Err(e) => {
                info!("Skipping corrupted journal entry at offset {}: {}", offset, e);
                // Try to find next valid entry by scanning for magic
                offset += 1;
                while offset + 4 <= data.len() {
                    if &data[offset..offset + 4] == JOURNAL_MAGIC {
                        break;
                    }
                    offset += 1;
                }
            }
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_journal_write_read() {
        let path = "/tmp/test_quay_journal_write_read.qjnl";
        let _ = fs::remove_file(path);

        let mut journal = Journal::open(path).unwrap();
        journal.log_enqueue("orders", Position(1), "m1").unwrap();
        journal.log_enqueue("orders", Position(2), "m2").unwrap();
        journal.log_dequeue("orders", Position(1)).unwrap();

        let entries = journal.read_entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            JournalEntry::Enqueue {
                queue: "orders".to_string(),
                position: Position(1),
                body: "m1".to_string(),
            }
        );
        assert_eq!(
            entries[2],
            JournalEntry::Dequeue {
                queue: "orders".to_string(),
                position: Position(1),
            }
        );

        journal.remove().unwrap();
        assert!(!std::path::Path::new(path).exists());
    }

    #[test]
    fn test_large_body_is_compressed() {
        let body = "replicated payload ".repeat(50);
        let entry = JournalEntry::Enqueue {
            queue: "q".to_string(),
            position: Position(7),
            body: body.clone(),
        };

        let encoded = entry.encode();
        assert!(encoded.len() < body.len());

        let (decoded, size) = JournalEntry::decode(&encoded).unwrap();
        assert_eq!(size, encoded.len());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_crc_validation() {
        let entry = JournalEntry::Dequeue {
            queue: "q".to_string(),
            position: Position(3),
        };

        let mut encoded = entry.encode();
        encoded[10] ^= 0xFF;

        assert!(JournalEntry::decode(&encoded).is_err());
    }

    #[test]
    fn test_corrupted_record_is_skipped() {
        let path = "/tmp/test_quay_journal_corrupt.qjnl";
        let _ = fs::remove_file(path);

        let first = JournalEntry::Enqueue {
            queue: "q".to_string(),
            position: Position(1),
            body: "a".to_string(),
        };
        let second = JournalEntry::Enqueue {
            queue: "q".to_string(),
            position: Position(2),
            body: "b".to_string(),
        };
        let mut bad = first.encode();
        bad[12] ^= 0xFF;
        let mut data = bad;
        data.extend_from_slice(&second.encode());
        fs::write(path, &data).unwrap();

        let entries = read_entries(Path::new(path)).unwrap();
        assert_eq!(entries, vec![second]);

        fs::remove_file(path).unwrap();
    }
}
