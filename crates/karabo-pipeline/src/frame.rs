//! # Frame Codec
//!
//! Data travels between an output and an input channel as frames:
//!
//! ```text
//! ┌─────────────┬─────────────────┬───────────┬────────────┐
//! │ headerLen   │ header (binary  │ bodyLen   │ body bytes │
//! │ u32 LE      │  encoded Hash)  │ u32 LE    │            │
//! └─────────────┴─────────────────┴───────────┴────────────┘
//! ```
//!
//! Header keys: `byteSize` (body length), `nData`, `endOfStream` and
//! `chunks`, one metadata Hash per data item (`source`, `format`,
//! `byteSize`, and a `timestamp` entry carrying `sec`/`frac`/`tid`).
//! The body is the concatenation of the items: binary-encoded Hashes or
//! raw byte blobs.
//!
//! Control messages (handshake, read requests) are a single length-prefixed
//! Hash.

use bytes::{BufMut, Bytes, BytesMut};
use karabo_data::io::{decode_hash, encode_hash};
use karabo_data::{Hash, KaraboError, Result, Timestamp};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest header or body accepted from the wire.
pub const MAX_SECTION: usize = 256 * 1024 * 1024;

const FORMAT_HASH: &str = "hash";
const FORMAT_BYTES: &str = "bytes";

/// One data item.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Hash(Hash),
    /// Opaque blob (images, ND arrays); its shape lives in the metadata.
    Bytes(Bytes),
}

impl From<Hash> for Payload {
    fn from(hash: Hash) -> Self {
        Self::Hash(hash)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl Payload {
    #[must_use]
    pub fn as_hash(&self) -> Option<&Hash> {
        match self {
            Self::Hash(h) => Some(h),
            Self::Bytes(_) => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Hash(_) => None,
        }
    }
}

/// Per-item metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    /// Producer of the item, usually `deviceId:channel`.
    pub source: String,
    pub timestamp: Timestamp,
}

impl ChunkMeta {
    #[must_use]
    pub fn new(source: &str, timestamp: Timestamp) -> Self {
        Self {
            source: source.to_string(),
            timestamp,
        }
    }

    fn to_hash(&self, format: &str, byte_size: usize) -> Hash {
        let mut meta = Hash::new()
            .with("source", self.source.as_str())
            .with("format", format)
            .with("byteSize", byte_size as u64);
        let node = meta.set_key("timestamp", true);
        self.timestamp.to_attributes(node.attributes_mut());
        meta
    }

    fn from_hash(meta: &Hash) -> Result<Self> {
        let timestamp = Timestamp::from_attributes(meta.get_node("timestamp")?.attributes())?;
        Ok(Self {
            source: meta.get::<String>("source")?,
            timestamp,
        })
    }
}

/// A decoded data frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub items: Vec<(Payload, ChunkMeta)>,
    pub end_of_stream: bool,
}

impl Frame {
    #[must_use]
    pub fn end_of_stream() -> Self {
        Self {
            items: Vec::new(),
            end_of_stream: true,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Wire image of the frame, ready to be written to any number of
    /// connections.
    pub fn encode(&self) -> Result<EncodedFrame> {
        let mut body = BytesMut::new();
        let mut chunks = Vec::with_capacity(self.items.len());
        for (payload, meta) in &self.items {
            let (format, bytes) = match payload {
                Payload::Hash(h) => (FORMAT_HASH, Bytes::from(encode_hash(h)?)),
                Payload::Bytes(b) => (FORMAT_BYTES, b.clone()),
            };
            chunks.push(meta.to_hash(format, bytes.len()));
            body.extend_from_slice(&bytes);
        }
        let header = Hash::new()
            .with("byteSize", body.len() as u64)
            .with("nData", self.items.len() as u32)
            .with("endOfStream", self.end_of_stream)
            .with("chunks", chunks);
        let header = encode_hash(&header)?;

        let mut wire = BytesMut::with_capacity(8 + header.len() + body.len());
        wire.put_u32_le(section_len(header.len())?);
        wire.extend_from_slice(&header);
        wire.put_u32_le(section_len(body.len())?);
        wire.extend_from_slice(&body);
        Ok(EncodedFrame {
            wire: wire.freeze(),
            n_data: self.items.len(),
            end_of_stream: self.end_of_stream,
        })
    }

    /// Rebuild a frame from its header and body.
    pub fn decode(header: &Hash, body: Bytes) -> Result<Self> {
        let byte_size = header
            .get_as::<u64>("byteSize")
            .map_err(|_| KaraboError::Protocol("frame header without byteSize".into()))?;
        if byte_size != body.len() as u64 {
            return Err(KaraboError::Protocol(format!(
                "body of {} bytes, header announces {byte_size}",
                body.len()
            )));
        }
        let end_of_stream = header.get::<bool>("endOfStream").unwrap_or(false);
        let chunks: &[Hash] = match header.get_vector_hash("chunks") {
            Ok(chunks) => chunks.as_slice(),
            Err(_) => &[],
        };
        let n_data = header.get_as::<u64>("nData").unwrap_or(chunks.len() as u64);
        if n_data != chunks.len() as u64 {
            return Err(KaraboError::Protocol(format!(
                "nData {n_data} but {} chunk descriptions",
                chunks.len()
            )));
        }

        let mut items = Vec::with_capacity(chunks.len());
        let mut offset = 0usize;
        for meta in chunks {
            let size = usize::try_from(meta.get_as::<u64>("byteSize")?)
                .map_err(|_| KaraboError::Protocol("chunk size overflow".into()))?;
            let end = offset
                .checked_add(size)
                .filter(|end| *end <= body.len())
                .ok_or_else(|| KaraboError::Protocol("chunk exceeds frame body".into()))?;
            let bytes = body.slice(offset..end);
            offset = end;
            let payload = match meta.get::<String>("format")?.as_str() {
                FORMAT_HASH => Payload::Hash(decode_hash(&bytes)?),
                FORMAT_BYTES => Payload::Bytes(bytes),
                other => {
                    return Err(KaraboError::Protocol(format!("unknown chunk format '{other}'")))
                }
            };
            items.push((payload, ChunkMeta::from_hash(meta)?));
        }
        if offset != body.len() {
            return Err(KaraboError::Protocol(format!(
                "{} trailing body bytes",
                body.len() - offset
            )));
        }
        Ok(Self {
            items,
            end_of_stream,
        })
    }
}

/// Serialized frame, shared between the queues of all inputs.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    wire: Bytes,
    n_data: usize,
    end_of_stream: bool,
}

impl EncodedFrame {
    #[must_use]
    pub fn n_data(&self) -> usize {
        self.n_data
    }

    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }

    /// The bytes written to the socket.
    #[must_use]
    pub fn wire(&self) -> &Bytes {
        &self.wire
    }
}

fn section_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|l| (*l as usize) <= MAX_SECTION)
        .ok_or_else(|| KaraboError::Protocol(format!("section of {len} bytes too large")))
}

fn io_error(e: std::io::Error) -> KaraboError {
    KaraboError::Io(e.to_string())
}

async fn read_section<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let len = reader.read_u32_le().await.map_err(io_error)? as usize;
    if len > MAX_SECTION {
        return Err(KaraboError::Protocol(format!("section of {len} bytes too large")));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(io_error)?;
    Ok(Bytes::from(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &EncodedFrame) -> Result<()> {
    writer.write_all(&frame.wire).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let header = read_section(reader).await?;
    let header = decode_hash(&header)
        .map_err(|e| KaraboError::Protocol(format!("undecodable frame header: {e}")))?;
    let body = read_section(reader).await?;
    Frame::decode(&header, body)
}

/// Write a single control Hash.
pub async fn write_control<W: AsyncWrite + Unpin>(writer: &mut W, message: &Hash) -> Result<()> {
    let bytes = encode_hash(message)?;
    writer
        .write_u32_le(section_len(bytes.len())?)
        .await
        .map_err(io_error)?;
    writer.write_all(&bytes).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)
}

pub async fn read_control<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Hash> {
    let bytes = read_section(reader).await?;
    decode_hash(&bytes).map_err(|e| KaraboError::Protocol(format!("undecodable control message: {e}")))
}
