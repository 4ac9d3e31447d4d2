//! Snapshot stream framing.
//!
//! A materialized snapshot is a header followed by the lexicographically
//! ordered `(key, value)` records of everything under `/registry/`. The
//! cluster-wide [`LogFormat`] selects the framing:
//!
//! - `json`: newline-delimited JSON, header first
//! - `protobuf`: length-prefixed prost messages, header first
//! - `protobuf+snappy`: the protobuf stream compressed with snappy
//!
//! Decoding verifies the embedded format code against the configured
//! format; a mismatch is an error rather than a best-effort read, since
//! log format migration is unsupported mid-cluster.

use std::io::{Read, Write};

use prost::Message;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use webmesh_proto::proto::{SnapshotHeader, SnapshotRecord};
use webmesh_types::LogFormat;

/// Version of the snapshot stream layout.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Errors from snapshot encoding and decoding.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SnapshotCodecError {
    /// The stream failed to encode.
    #[snafu(display("encode snapshot: {message}"))]
    EncodeSnapshot {
        /// Encoder error text.
        message: String,
    },

    /// The stream failed to decode.
    #[snafu(display("decode snapshot: {message}"))]
    DecodeSnapshot {
        /// Decoder error text.
        message: String,
    },

    /// The stream was written with a different log format.
    #[snafu(display("snapshot format code {stored} does not match configured format {configured}"))]
    FormatCode {
        /// Code embedded in the stream.
        stored: u32,
        /// The configured format.
        configured: LogFormat,
    },

    /// The stream layout version is unknown.
    #[snafu(display("unsupported snapshot format version {version}"))]
    FormatVersion {
        /// Version embedded in the stream.
        version: u32,
    },
}

/// The decoded content of a snapshot stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPayload {
    /// Term of the last log entry covered by the snapshot.
    pub term: u64,
    /// Index of the last log entry covered by the snapshot.
    pub index: u64,
    /// Ordered `(key, value)` records.
    pub records: Vec<(String, String)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonHeader {
    format_version: u32,
    format_code: u32,
    term: u64,
    index: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonRecord {
    key: String,
    value: String,
}

/// Encoder/decoder for snapshot streams in the configured format.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCodec {
    format: LogFormat,
}

impl SnapshotCodec {
    /// Creates a codec for the given format.
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }

    /// The configured format.
    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Encodes a payload into a framed stream.
    pub fn encode(&self, payload: &SnapshotPayload) -> Result<Vec<u8>, SnapshotCodecError> {
        match self.format {
            LogFormat::Json => self.encode_json(payload),
            LogFormat::Protobuf => self.encode_protobuf(payload),
            LogFormat::ProtobufSnappy => {
                let plain = self.encode_protobuf(payload)?;
                let mut encoder = snap::write::FrameEncoder::new(Vec::new());
                encoder
                    .write_all(&plain)
                    .and_then(|()| {
                        encoder
                            .into_inner()
                            .map_err(|e| std::io::Error::other(e.to_string()))
                    })
                    .map_err(|e| SnapshotCodecError::EncodeSnapshot {
                        message: e.to_string(),
                    })
            }
        }
    }

    /// Decodes a framed stream back into its payload.
    pub fn decode(&self, data: &[u8]) -> Result<SnapshotPayload, SnapshotCodecError> {
        match self.format {
            LogFormat::Json => self.decode_json(data),
            LogFormat::Protobuf => self.decode_protobuf(data),
            LogFormat::ProtobufSnappy => {
                let mut plain = Vec::new();
                snap::read::FrameDecoder::new(data)
                    .read_to_end(&mut plain)
                    .map_err(|e| SnapshotCodecError::DecodeSnapshot {
                        message: e.to_string(),
                    })?;
                self.decode_protobuf(&plain)
            }
        }
    }

    fn encode_json(&self, payload: &SnapshotPayload) -> Result<Vec<u8>, SnapshotCodecError> {
        let encode_err = |e: serde_json::Error| SnapshotCodecError::EncodeSnapshot {
            message: e.to_string(),
        };
        let mut out = Vec::new();
        let header = JsonHeader {
            format_version: SNAPSHOT_FORMAT_VERSION,
            format_code: self.format.code(),
            term: payload.term,
            index: payload.index,
        };
        out.extend_from_slice(serde_json::to_string(&header).map_err(encode_err)?.as_bytes());
        out.push(b'\n');
        for (key, value) in &payload.records {
            let record = JsonRecord {
                key: key.clone(),
                value: value.clone(),
            };
            out.extend_from_slice(serde_json::to_string(&record).map_err(encode_err)?.as_bytes());
            out.push(b'\n');
        }
        Ok(out)
    }

    fn decode_json(&self, data: &[u8]) -> Result<SnapshotPayload, SnapshotCodecError> {
        let text = std::str::from_utf8(data).map_err(|e| SnapshotCodecError::DecodeSnapshot {
            message: e.to_string(),
        })?;
        let mut lines = text.lines().filter(|l| !l.is_empty());
        let header_line = lines
            .next()
            .ok_or_else(|| SnapshotCodecError::DecodeSnapshot {
                message: "empty snapshot stream".to_string(),
            })?;
        let header: JsonHeader =
            serde_json::from_str(header_line).map_err(|e| SnapshotCodecError::DecodeSnapshot {
                message: e.to_string(),
            })?;
        self.check_header(header.format_version, header.format_code)?;

        let mut records = Vec::new();
        for line in lines {
            let record: JsonRecord =
                serde_json::from_str(line).map_err(|e| SnapshotCodecError::DecodeSnapshot {
                    message: e.to_string(),
                })?;
            records.push((record.key, record.value));
        }
        Ok(SnapshotPayload {
            term: header.term,
            index: header.index,
            records,
        })
    }

    fn encode_protobuf(&self, payload: &SnapshotPayload) -> Result<Vec<u8>, SnapshotCodecError> {
        let mut out = Vec::new();
        let header = SnapshotHeader {
            format_version: SNAPSHOT_FORMAT_VERSION,
            format_code: self.format.code(),
            term: payload.term,
            index: payload.index,
        };
        write_frame(&mut out, &header.encode_to_vec());
        for (key, value) in &payload.records {
            let record = SnapshotRecord {
                key: key.clone(),
                value: value.clone(),
            };
            write_frame(&mut out, &record.encode_to_vec());
        }
        Ok(out)
    }

    fn decode_protobuf(&self, data: &[u8]) -> Result<SnapshotPayload, SnapshotCodecError> {
        let mut cursor = data;
        let header_frame =
            read_frame(&mut cursor)?.ok_or_else(|| SnapshotCodecError::DecodeSnapshot {
                message: "empty snapshot stream".to_string(),
            })?;
        let header = SnapshotHeader::decode(header_frame).map_err(|e| {
            SnapshotCodecError::DecodeSnapshot {
                message: e.to_string(),
            }
        })?;
        self.check_header(header.format_version, header.format_code)?;

        let mut records = Vec::new();
        while let Some(frame) = read_frame(&mut cursor)? {
            let record =
                SnapshotRecord::decode(frame).map_err(|e| SnapshotCodecError::DecodeSnapshot {
                    message: e.to_string(),
                })?;
            records.push((record.key, record.value));
        }
        Ok(SnapshotPayload {
            term: header.term,
            index: header.index,
            records,
        })
    }

    fn check_header(&self, version: u32, code: u32) -> Result<(), SnapshotCodecError> {
        if version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotCodecError::FormatVersion { version });
        }
        if code != self.format.code() {
            return Err(SnapshotCodecError::FormatCode {
                stored: code,
                configured: self.format,
            });
        }
        Ok(())
    }
}

fn write_frame(out: &mut Vec<u8>, frame: &[u8]) {
    out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    out.extend_from_slice(frame);
}

fn read_frame<'a>(cursor: &mut &'a [u8]) -> Result<Option<&'a [u8]>, SnapshotCodecError> {
    if cursor.is_empty() {
        return Ok(None);
    }
    if cursor.len() < 4 {
        return Err(SnapshotCodecError::DecodeSnapshot {
            message: "truncated frame length".to_string(),
        });
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&cursor[..4]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if cursor.len() < 4 + len {
        return Err(SnapshotCodecError::DecodeSnapshot {
            message: "truncated frame body".to_string(),
        });
    }
    let frame = &cursor[4..4 + len];
    *cursor = &cursor[4 + len..];
    Ok(Some(frame))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample_payload() -> SnapshotPayload {
        SnapshotPayload {
            term: 3,
            index: 42,
            records: vec![
                ("/registry/abc".to_string(), "def".to_string()),
                ("/registry/baz".to_string(), "qux".to_string()),
                ("/registry/foo".to_string(), "bar".to_string()),
            ],
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = SnapshotCodec::new(LogFormat::Json);
        let bytes = codec.encode(&sample_payload()).expect("encode");
        let decoded = codec.decode(&bytes).expect("decode");
        assert_eq!(decoded, sample_payload());
    }

    #[test]
    fn test_protobuf_roundtrip() {
        let codec = SnapshotCodec::new(LogFormat::Protobuf);
        let bytes = codec.encode(&sample_payload()).expect("encode");
        let decoded = codec.decode(&bytes).expect("decode");
        assert_eq!(decoded, sample_payload());
    }

    #[test]
    fn test_protobuf_snappy_roundtrip() {
        let codec = SnapshotCodec::new(LogFormat::ProtobufSnappy);
        let bytes = codec.encode(&sample_payload()).expect("encode");
        let decoded = codec.decode(&bytes).expect("decode");
        assert_eq!(decoded, sample_payload());
    }

    #[test]
    fn test_format_mismatch_rejected() {
        let json = SnapshotCodec::new(LogFormat::Json);
        let bytes = json.encode(&sample_payload()).expect("encode");
        // A json stream does not even parse as protobuf frames; the
        // interesting case is the embedded code check across the two
        // protobuf variants, which share framing.
        let protobuf = SnapshotCodec::new(LogFormat::Protobuf);
        let pb_bytes = protobuf.encode(&sample_payload()).expect("encode");
        let snappy = SnapshotCodec::new(LogFormat::ProtobufSnappy);
        assert!(snappy.decode(&pb_bytes).is_err());
        assert!(protobuf.decode(&bytes).is_err());
    }

    #[test]
    fn test_truncated_stream_rejected() {
        let codec = SnapshotCodec::new(LogFormat::Protobuf);
        let bytes = codec.encode(&sample_payload()).expect("encode");
        assert!(codec.decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let codec = SnapshotCodec::new(LogFormat::Json);
        let payload = SnapshotPayload::default();
        let decoded = codec.decode(&codec.encode(&payload).unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }
}
