use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use log::warn;

use crate::core::errors::StorageError;
use crate::core::Result;

const FILE_MAGIC: [u8; 8] = *b"SHEAF001";
const FILE_VERSION: u16 = 1;
const FILE_HEADER_SIZE: u64 = 8 + 2;
const CHUNK_MAGIC: u32 = 0x5348_4B31;

/// Metadata carried by the trailer of each chunk. The last valid trailer at
/// open time defines the map state.
#[derive(Debug, Clone, Default)]
pub struct ChunkTrailer {
    pub chunk_id: u64,
    pub root_pos: u64,
    pub map_size: u64,
    pub max_key: u64,
    pub replica_hosts: Vec<String>,
}

impl ChunkTrailer {
    fn encode(&self, buf: &mut Vec<u8>) {
        let _ = buf.write_u64::<LittleEndian>(self.chunk_id);
        let _ = buf.write_u64::<LittleEndian>(self.root_pos);
        let _ = buf.write_u64::<LittleEndian>(self.map_size);
        let _ = buf.write_u64::<LittleEndian>(self.max_key);
        let _ = buf.write_u32::<LittleEndian>(self.replica_hosts.len() as u32);
        for host in &self.replica_hosts {
            let bytes = host.as_bytes();
            let _ = buf.write_u32::<LittleEndian>(bytes.len() as u32);
            buf.extend_from_slice(bytes);
        }
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        let chunk_id = buf.read_u64::<LittleEndian>()?;
        let root_pos = buf.read_u64::<LittleEndian>()?;
        let map_size = buf.read_u64::<LittleEndian>()?;
        let max_key = buf.read_u64::<LittleEndian>()?;
        let host_count = buf.read_u32::<LittleEndian>()? as usize;
        let mut replica_hosts = Vec::with_capacity(host_count);
        for _ in 0..host_count {
            let len = buf.read_u32::<LittleEndian>()? as usize;
            if buf.len() < len {
                return Err(StorageError("truncated trailer host list".into()).into());
            }
            let (head, rest) = buf.split_at(len);
            replica_hosts.push(
                String::from_utf8(head.to_vec())
                    .map_err(|_| StorageError("invalid utf-8 in trailer".into()))?,
            );
            buf = rest;
        }
        Ok(Self {
            chunk_id,
            root_pos,
            map_size,
            max_key,
            replica_hosts,
        })
    }
}

/// Append-only chunk file. Each `save` appends one chunk:
///
/// ```text
/// file   := header chunk*
/// header := magic version
/// chunk  := CHUNK_MAGIC body_len body crc32(body)
/// body   := page_image* trailer
/// ```
///
/// Page positions are absolute file offsets of the `len`-prefixed image.
/// A partial chunk fails its crc at open and is discarded; the prior chunk
/// stays authoritative.
pub struct ChunkFile {
    file: File,
    append_at: u64,
    last_trailer: Option<ChunkTrailer>,
    next_chunk_id: u64,
}

impl ChunkFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        if len == 0 {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&FILE_MAGIC)?;
            file.write_u16::<LittleEndian>(FILE_VERSION)?;
            file.sync_all()?;
            return Ok(Self {
                file,
                append_at: FILE_HEADER_SIZE,
                last_trailer: None,
                next_chunk_id: 1,
            });
        }

        file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if magic != FILE_MAGIC {
            return Err(StorageError("bad chunk file magic".into()).into());
        }
        let version = file.read_u16::<LittleEndian>()?;
        if version != FILE_VERSION {
            return Err(StorageError(format!("unsupported chunk file version {version}")).into());
        }

        let mut store = Self {
            file,
            append_at: FILE_HEADER_SIZE,
            last_trailer: None,
            next_chunk_id: 1,
        };
        store.scan_chunks(len)?;
        Ok(store)
    }

    /// Forward scan validating each chunk; stops at the first corrupt or
    /// truncated one.
    fn scan_chunks(&mut self, file_len: u64) -> Result<()> {
        let mut offset = FILE_HEADER_SIZE;
        loop {
            if offset + 12 > file_len {
                break;
            }
            self.file.seek(SeekFrom::Start(offset))?;
            let magic = self.file.read_u32::<LittleEndian>()?;
            if magic != CHUNK_MAGIC {
                warn!("chunk at offset {offset} has bad magic, discarding tail");
                break;
            }
            let body_len = self.file.read_u64::<LittleEndian>()?;
            let body_end = offset + 12 + body_len;
            if body_end + 4 > file_len {
                warn!("chunk at offset {offset} is truncated, discarding tail");
                break;
            }
            let mut body = vec![0u8; body_len as usize];
            self.file.read_exact(&mut body)?;
            let stored_crc = self.file.read_u32::<LittleEndian>()?;
            let mut hasher = Hasher::new();
            hasher.update(&body);
            if hasher.finalize() != stored_crc {
                warn!("chunk at offset {offset} fails its checksum, discarding tail");
                break;
            }

            let trailer_len = read_trailer_len(&body)?;
            let trailer_start = body
                .len()
                .checked_sub(4 + trailer_len)
                .ok_or_else(|| StorageError("trailer length exceeds chunk body".into()))?;
            let trailer = ChunkTrailer::decode(&body[trailer_start..body.len() - 4])?;
            self.next_chunk_id = trailer.chunk_id + 1;
            self.last_trailer = Some(trailer);
            offset = body_end + 4;
        }
        self.append_at = offset;
        Ok(())
    }

    pub fn last_trailer(&self) -> Option<&ChunkTrailer> {
        self.last_trailer.as_ref()
    }

    pub fn next_chunk_id(&self) -> u64 {
        self.next_chunk_id
    }

    /// Read one `len`-prefixed page image at an absolute position.
    pub fn read_page(&mut self, pos: u64) -> Result<Vec<u8>> {
        if pos < FILE_HEADER_SIZE {
            return Err(StorageError(format!("invalid page position {pos}")).into());
        }
        self.file.seek(SeekFrom::Start(pos))?;
        let len = self.file.read_u32::<LittleEndian>()? as usize;
        let mut image = vec![0u8; len];
        self.file.read_exact(&mut image)?;
        Ok(image)
    }

    /// Append a chunk built by `fill`, which receives a [`ChunkWriter`] to
    /// add page images and must return the trailer metadata.
    pub fn append_chunk<F>(&mut self, fill: F) -> Result<ChunkTrailer>
    where
        F: FnOnce(&mut ChunkWriter) -> Result<ChunkTrailer>,
    {
        let chunk_id = self.next_chunk_id;
        let mut writer = ChunkWriter {
            body: Vec::new(),
            body_base: self.append_at + 12,
        };
        let mut trailer = fill(&mut writer)?;
        trailer.chunk_id = chunk_id;

        let mut trailer_bytes = Vec::new();
        trailer.encode(&mut trailer_bytes);
        writer.body.extend_from_slice(&trailer_bytes);
        let _ = writer
            .body
            .write_u32::<LittleEndian>(trailer_bytes.len() as u32);

        let mut hasher = Hasher::new();
        hasher.update(&writer.body);
        let crc = hasher.finalize();

        self.file.seek(SeekFrom::Start(self.append_at))?;
        self.file.write_u32::<LittleEndian>(CHUNK_MAGIC)?;
        self.file.write_u64::<LittleEndian>(writer.body.len() as u64)?;
        self.file.write_all(&writer.body)?;
        self.file.write_u32::<LittleEndian>(crc)?;
        self.file.sync_all()?;

        self.append_at += 12 + writer.body.len() as u64 + 4;
        self.next_chunk_id += 1;
        self.last_trailer = Some(trailer.clone());
        Ok(trailer)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

fn read_trailer_len(body: &[u8]) -> Result<usize> {
    if body.len() < 4 {
        return Err(StorageError("chunk body too small for trailer".into()).into());
    }
    let mut tail = &body[body.len() - 4..];
    Ok(tail.read_u32::<LittleEndian>()? as usize)
}

/// Accumulates the page images of one chunk and hands out their final file
/// positions.
pub struct ChunkWriter {
    body: Vec<u8>,
    body_base: u64,
}

impl ChunkWriter {
    /// Append a page image; returns its absolute position in the file.
    pub fn write_page(&mut self, image: &[u8]) -> u64 {
        let pos = self.body_base + self.body.len() as u64;
        let _ = self.body.write_u32::<LittleEndian>(image.len() as u32);
        self.body.extend_from_slice(image);
        pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn chunk_round_trip_and_corrupt_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.chunk");

        let mut file = ChunkFile::open(&path).unwrap();
        let mut page_pos = 0;
        let trailer = file
            .append_chunk(|w| {
                page_pos = w.write_page(b"page-one");
                Ok(ChunkTrailer {
                    chunk_id: 0,
                    root_pos: page_pos,
                    map_size: 1,
                    max_key: 1,
                    replica_hosts: vec!["node-a".into()],
                })
            })
            .unwrap();
        assert_eq!(trailer.chunk_id, 1);
        drop(file);

        // Simulate a partial second chunk.
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&CHUNK_MAGIC.to_le_bytes()).unwrap();
        raw.write_all(&999u64.to_le_bytes()).unwrap();
        raw.write_all(b"garbage").unwrap();
        drop(raw);

        let mut file = ChunkFile::open(&path).unwrap();
        let trailer = file.last_trailer().cloned().unwrap();
        assert_eq!(trailer.chunk_id, 1);
        assert_eq!(trailer.map_size, 1);
        assert_eq!(trailer.replica_hosts, vec!["node-a".to_string()]);
        assert_eq!(file.read_page(trailer.root_pos).unwrap(), b"page-one");
    }
}
