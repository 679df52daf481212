//! # Chunked Transfers
//!
//! Upload planning and download reassembly for attachments.
//!
//! Uploads are hashed and deflated up front, then cut into fixed-size chunks that
//! are sent strictly in order. Downloads feed each received chunk into a
//! [`TransferAccumulator`]; the protocol has no way to reorder or resume a
//! transfer, so chunks are accepted only in arrival order.

use crate::error::{ProtocolError, Result};
use crate::protocol::message::DownloadHeader;
use crate::utils::compression::{self, StreamInflater};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Reassembles a chunked download
pub trait TransferAccumulator: Send {
    /// Append the next chunk
    fn push(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes received so far, before any decompression
    fn offset(&self) -> u64;

    /// Consume the accumulator and return the reassembled data
    fn finish(self: Box<Self>) -> Result<Vec<u8>>;
}

/// Collects chunks verbatim, leaving the stream compressed
#[derive(Debug, Default)]
pub struct BasicAccumulator {
    data: Vec<u8>,
}

impl TransferAccumulator for BasicAccumulator {
    fn push(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.data.len() as u64
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        Ok(self.data)
    }
}

/// Inflates a zlib stream as chunks arrive
#[derive(Default)]
pub struct InflatorAccumulator {
    inflater: StreamInflater,
    offset: u64,
}

impl InflatorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransferAccumulator for InflatorAccumulator {
    fn push(&mut self, data: &[u8]) -> Result<()> {
        self.inflater.push(data)?;
        self.offset += data.len() as u64;
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        self.inflater.finish()
    }
}

/// One chunk of an attachment download as received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadChunk {
    pub request_id: i16,
    pub index: i32,
    /// Present on the first chunk only
    pub header: Option<DownloadHeader>,
    pub is_last: bool,
    pub data: Bytes,
}

/// A file queued for upload
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub data: Bytes,
}

impl FileUpload {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk, naming the upload after the file
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| ProtocolError::Custom(format!("Not a file: {}", path.display())))?;
        let data = tokio::fs::read(path).await?;
        Ok(Self::new(name, data))
    }
}

/// An upload that has been hashed and compressed, ready to be chunked
#[derive(Debug, Clone)]
pub struct PreparedUpload {
    pub file_name: String,
    /// Hex SHA-256 of the original file
    pub hash: String,
    pub original_size: u64,
    pub compressed: Bytes,
    pub chunk_size: usize,
}

/// A single upload packet's worth of data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    pub index: i32,
    pub is_last: bool,
    pub data: Bytes,
    /// Cumulative progress to report once this chunk is sent
    pub progress: u64,
}

/// Hex SHA-256 digest of a file's content
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash and compress an upload; CPU-bound, run it off the async runtime
pub fn prepare_upload(upload: &FileUpload, chunk_size: usize) -> Result<PreparedUpload> {
    if chunk_size == 0 {
        return Err(ProtocolError::ConfigError("Chunk size cannot be 0".to_string()));
    }

    Ok(PreparedUpload {
        file_name: upload.name.clone(),
        hash: content_hash(&upload.data),
        original_size: upload.data.len() as u64,
        compressed: Bytes::from(compression::deflate(&upload.data)?),
        chunk_size,
    })
}

impl PreparedUpload {
    /// Split the compressed stream into ordered chunks
    ///
    /// The last flag is set on the chunk that reaches the end of the compressed
    /// data. Progress is the compressed offset capped at the original file size.
    pub fn chunks(&self) -> Vec<UploadChunk> {
        let total = self.compressed.len();
        let mut chunks = Vec::with_capacity(total.div_ceil(self.chunk_size).max(1));
        let mut offset = 0usize;
        let mut index = 0i32;

        while offset < total {
            let end = (offset + self.chunk_size).min(total);
            chunks.push(UploadChunk {
                index,
                is_last: end >= total,
                data: self.compressed.slice(offset..end),
                progress: (end as u64).min(self.original_size),
            });
            offset = end;
            index += 1;
        }
        chunks
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_boundaries() {
        let upload = PreparedUpload {
            file_name: "a.bin".to_string(),
            hash: String::new(),
            original_size: 100,
            compressed: Bytes::from(vec![7u8; 25]),
            chunk_size: 10,
        };
        let chunks = upload.chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            chunks.iter().map(|c| c.is_last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(chunks[2].data.len(), 5);
        assert_eq!(chunks[2].progress, 25);
    }

    #[test]
    fn test_progress_capped_at_original_size() {
        // Incompressible input can grow when deflated
        let upload = PreparedUpload {
            file_name: "a.bin".to_string(),
            hash: String::new(),
            original_size: 12,
            compressed: Bytes::from(vec![1u8; 20]),
            chunk_size: 8,
        };
        let progress: Vec<u64> = upload.chunks().iter().map(|c| c.progress).collect();
        assert_eq!(progress, vec![8, 12, 12]);
    }

    #[test]
    fn test_exact_multiple_marks_last_chunk() {
        let upload = PreparedUpload {
            file_name: "a.bin".to_string(),
            hash: String::new(),
            original_size: 20,
            compressed: Bytes::from(vec![0u8; 20]),
            chunk_size: 10,
        };
        let chunks = upload.chunks();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_last);
        assert!(!chunks[0].is_last);
    }

    #[test]
    fn test_prepare_upload_hash_and_inflate() {
        let upload = FileUpload::new("note.txt", b"hello hello hello".to_vec());
        let prepared = prepare_upload(&upload, 4).unwrap();
        assert_eq!(prepared.hash, content_hash(b"hello hello hello"));
        assert_eq!(prepared.original_size, 17);

        let mut accumulator: Box<dyn TransferAccumulator> = Box::new(InflatorAccumulator::new());
        for chunk in prepared.chunks() {
            accumulator.push(&chunk.data).unwrap();
        }
        assert_eq!(accumulator.offset(), prepared.compressed.len() as u64);
        assert_eq!(accumulator.finish().unwrap(), b"hello hello hello");
    }

    #[test]
    fn test_basic_accumulator_keeps_stream() {
        let mut accumulator: Box<dyn TransferAccumulator> = Box::new(BasicAccumulator::default());
        accumulator.push(b"abc").unwrap();
        accumulator.push(b"def").unwrap();
        assert_eq!(accumulator.offset(), 6);
        assert_eq!(accumulator.finish().unwrap(), b"abcdef");
    }

    #[test]
    fn test_content_hash_known_value() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let upload = FileUpload::new("a", Vec::new());
        assert!(prepare_upload(&upload, 0).is_err());
    }

    #[tokio::test]
    async fn test_upload_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        tokio::fs::write(&path, b"png").await.unwrap();

        let upload = FileUpload::from_path(&path).await.unwrap();
        assert_eq!(upload.name, "photo.png");
        assert_eq!(&upload.data[..], b"png");
    }
}
