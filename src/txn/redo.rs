use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::core::Result;

/// Append-only redo log. Each record is `len crc payload`; commit appends
/// the transaction's redo buffer and syncs before the commit acknowledges.
pub struct RedoLog {
    file: File,
}

impl RedoLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        let mut hasher = Hasher::new();
        hasher.update(payload);
        self.file.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.file.write_u32::<LittleEndian>(hasher.finalize())?;
        self.file.write_all(payload)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// All intact records from the start; a record failing its checksum ends
    /// the scan (torn tail).
    pub fn read_all(&mut self) -> Result<Vec<Vec<u8>>> {
        let len = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut records = Vec::new();
        let mut offset = 0u64;
        while offset + 8 <= len {
            let payload_len = self.file.read_u32::<LittleEndian>()? as u64;
            let stored_crc = self.file.read_u32::<LittleEndian>()?;
            if offset + 8 + payload_len > len {
                break;
            }
            let mut payload = vec![0u8; payload_len as usize];
            self.file.read_exact(&mut payload)?;
            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != stored_crc {
                break;
            }
            records.push(payload);
            offset += 8 + payload_len;
        }
        self.file.seek(SeekFrom::End(0))?;
        Ok(records)
    }
}

impl std::fmt::Debug for RedoLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedoLog").finish()
    }
}
