// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire formats for the object-store ingestion path.
//!
//! An object fetched from the store is a gzip-compressed envelope of one or
//! more length-prefixed records. Each record carries an id, a routing string
//! and an opaque payload; a non-empty payload zlib-decompresses to a crash
//! bundle: the `CR1` marker, a fixed header, and that many `(index, name,
//! data)` file entries. Bundles unpack into freshly created, collision-safe
//! directories under a landing zone.
//!
//! Envelope layout, all integers little-endian:
//!
//! ```text
//! repeat { varint record_len, record_len bytes }
//! record  = varint id | varint routing_len, routing bytes | varint payload_len, payload bytes
//! bundle  = "CR1" | i32 dir_len, dir bytes | i32 file_len, file bytes
//!         | i32 uncompressed_size | i32 file_count
//!         | file_count * ( i32 index | i32 name_len, name bytes | i32 data_len, data bytes )
//! ```

use bytes::Buf;
use flate2::read::{GzDecoder, ZlibDecoder};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Marker opening every supported crash bundle payload.
pub const BUNDLE_MARKER: &[u8; 3] = b"CR1";

/// Ceiling applied to every decompression, header string and file entry so a
/// malformed or hostile record cannot balloon memory.
pub const MAX_DECOMPRESSED_BYTES: usize = 256 * 1024 * 1024;
const MAX_STRING_BYTES: i32 = 4096;
const MAX_FILE_COUNT: i32 = 512;
const DUPE_SUFFIX_LIMIT: u32 = 999;

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("truncated varint")]
    TruncatedVarint,
    #[error("varint exceeds 64 bits")]
    OversizedVarint,
    #[error("record of {declared} bytes overruns the remaining {remaining}")]
    RecordOverrun { declared: u64, remaining: usize },
    #[error("truncated record field")]
    TruncatedField,
    #[error("payload does not start with the CR1 marker")]
    UnsupportedLayout,
    #[error("header field out of range: {0}")]
    HeaderField(&'static str),
    #[error("string field is not valid UTF-8")]
    BadString(#[from] std::string::FromUtf8Error),
    #[error("header declares {declared} bytes but entries carry {actual}")]
    SizeMismatch { declared: i64, actual: i64 },
    #[error("unsafe file name in bundle: {0}")]
    UnsafeName(String),
    #[error("decompressed data exceeds {0} bytes")]
    TooLarge(usize),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One record of the outer envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: u64,
    pub routing: String,
    pub payload: Vec<u8>,
}

/// Splits a decompressed envelope into its records.
pub fn decode_records(mut buf: &[u8]) -> Result<Vec<Record>, BundleError> {
    let mut records = Vec::new();
    while buf.has_remaining() {
        let len = read_varint(&mut buf)?;
        if len > buf.remaining() as u64 {
            return Err(BundleError::RecordOverrun {
                declared: len,
                remaining: buf.remaining(),
            });
        }
        let (mut record, rest) = buf.split_at(len as usize);
        buf = rest;
        records.push(decode_record(&mut record)?);
    }
    Ok(records)
}

fn decode_record(buf: &mut &[u8]) -> Result<Record, BundleError> {
    let id = read_varint(buf)?;
    let routing = read_varint_bytes(buf)?;
    let payload = read_varint_bytes(buf)?;
    Ok(Record {
        id,
        routing: String::from_utf8(routing)?,
        payload,
    })
}

fn read_varint(buf: &mut &[u8]) -> Result<u64, BundleError> {
    let mut value: u64 = 0;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(BundleError::TruncatedVarint);
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(BundleError::OversizedVarint)
}

fn read_varint_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, BundleError> {
    let len = read_varint(buf)?;
    if len > buf.remaining() as u64 {
        return Err(BundleError::TruncatedField);
    }
    let bytes = buf[..len as usize].to_vec();
    buf.advance(len as usize);
    Ok(bytes)
}

/// Encodes records into an envelope. Used by producers in tests; the
/// pipeline itself only consumes.
pub fn encode_records(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        let mut body = Vec::new();
        write_varint(&mut body, record.id);
        write_varint(&mut body, record.routing.len() as u64);
        body.extend_from_slice(record.routing.as_bytes());
        write_varint(&mut body, record.payload.len() as u64);
        body.extend_from_slice(&record.payload);

        write_varint(&mut out, body.len() as u64);
        out.extend_from_slice(&body);
    }
    out
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// One file carried inside a crash bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub index: i32,
    pub name: String,
    pub data: Vec<u8>,
}

/// A parsed crash bundle: the client-chosen directory name plus its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashBundle {
    pub directory_name: String,
    pub file_name: String,
    pub uncompressed_size: i32,
    pub files: Vec<BundleFile>,
}

impl CrashBundle {
    /// Parses an already zlib-decompressed payload.
    pub fn parse(payload: &[u8]) -> Result<CrashBundle, BundleError> {
        let mut buf = payload;
        if buf.remaining() < BUNDLE_MARKER.len() || buf[..3] != BUNDLE_MARKER[..] {
            return Err(BundleError::UnsupportedLayout);
        }
        buf.advance(BUNDLE_MARKER.len());

        let directory_name = read_prefixed_string(&mut buf, "directory name")?;
        let file_name = read_prefixed_string(&mut buf, "file name")?;
        let uncompressed_size = read_i32(&mut buf, "uncompressed size")?;
        let file_count = read_i32(&mut buf, "file count")?;
        if uncompressed_size < 0 {
            return Err(BundleError::HeaderField("uncompressed size"));
        }
        if !(0..=MAX_FILE_COUNT).contains(&file_count) {
            return Err(BundleError::HeaderField("file count"));
        }

        let mut files = Vec::with_capacity(file_count as usize);
        let mut actual: i64 = 0;
        for _ in 0..file_count {
            let index = read_i32(&mut buf, "file index")?;
            let name = read_prefixed_string(&mut buf, "entry name")?;
            let data_len = read_i32(&mut buf, "entry length")?;
            if data_len < 0 || data_len as usize > MAX_DECOMPRESSED_BYTES {
                return Err(BundleError::HeaderField("entry length"));
            }
            if buf.remaining() < data_len as usize {
                return Err(BundleError::TruncatedField);
            }
            let data = buf[..data_len as usize].to_vec();
            buf.advance(data_len as usize);
            actual += i64::from(data_len);
            files.push(BundleFile { index, name, data });
        }

        if actual != i64::from(uncompressed_size) {
            return Err(BundleError::SizeMismatch {
                declared: i64::from(uncompressed_size),
                actual,
            });
        }

        Ok(CrashBundle {
            directory_name,
            file_name,
            uncompressed_size,
            files,
        })
    }

    /// Writes the bundle's files into a freshly created directory under
    /// `landing_zone`, suffixing `_DUPEnnn` when the name is taken. Returns
    /// the directory created.
    pub fn unpack_into(&self, landing_zone: &Path) -> Result<PathBuf, BundleError> {
        let base = sanitize_name(&self.directory_name)?;
        let target = claim_directory(landing_zone, &base)?;

        for file in &self.files {
            let name = sanitize_name(&file.name)?;
            fs::write(target.join(name), &file.data)?;
        }
        Ok(target)
    }
}

fn read_i32(buf: &mut &[u8], field: &'static str) -> Result<i32, BundleError> {
    if buf.remaining() < 4 {
        return Err(BundleError::HeaderField(field));
    }
    Ok(buf.get_i32_le())
}

fn read_prefixed_string(buf: &mut &[u8], field: &'static str) -> Result<String, BundleError> {
    let len = read_i32(buf, field)?;
    if !(0..=MAX_STRING_BYTES).contains(&len) || buf.remaining() < len as usize {
        return Err(BundleError::HeaderField(field));
    }
    let bytes = buf[..len as usize].to_vec();
    buf.advance(len as usize);
    Ok(String::from_utf8(bytes)?)
}

/// Rejects names that would escape the target directory.
fn sanitize_name(name: &str) -> Result<&str, BundleError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(BundleError::UnsafeName(name.to_string()));
    }
    Ok(name)
}

/// Creates `base` under `landing_zone`, or the first free `base_DUPEnnn`.
fn claim_directory(landing_zone: &Path, base: &str) -> Result<PathBuf, BundleError> {
    let candidate = landing_zone.join(base);
    match fs::create_dir(&candidate) {
        Ok(()) => return Ok(candidate),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(BundleError::Io(e)),
    }
    for n in 1..=DUPE_SUFFIX_LIMIT {
        let candidate = landing_zone.join(format!("{base}_DUPE{n:03}"));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(BundleError::Io(e)),
        }
    }
    Err(BundleError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free DUPE suffix for {base}"),
    )))
}

/// Pure buffer-to-buffer zlib decompression with a hard output ceiling.
pub fn zlib_decompress(bytes: &[u8], max_size: usize) -> Result<Vec<u8>, BundleError> {
    bounded_read(ZlibDecoder::new(bytes), max_size)
}

/// Pure buffer-to-buffer gzip decompression with a hard output ceiling.
pub fn gzip_decompress(bytes: &[u8], max_size: usize) -> Result<Vec<u8>, BundleError> {
    bounded_read(GzDecoder::new(bytes), max_size)
}

fn bounded_read(reader: impl Read, max_size: usize) -> Result<Vec<u8>, BundleError> {
    let mut out = Vec::new();
    let mut limited = reader.take(max_size as u64 + 1);
    limited.read_to_end(&mut out)?;
    if out.len() > max_size {
        return Err(BundleError::TooLarge(max_size));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn zlib_compress(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn push_string(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as i32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    /// Builds a minimal bundle: dir "abc", file "f", one entry
    /// (0, "x.txt", 12, b"hello world!").
    fn sample_bundle_bytes() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(BUNDLE_MARKER);
        push_string(&mut out, "abc");
        push_string(&mut out, "f");
        out.extend_from_slice(&12i32.to_le_bytes()); // uncompressed size
        out.extend_from_slice(&1i32.to_le_bytes()); // file count
        out.extend_from_slice(&0i32.to_le_bytes()); // entry index
        push_string(&mut out, "x.txt");
        out.extend_from_slice(&12i32.to_le_bytes());
        out.extend_from_slice(b"hello world!");
        out
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            let mut buf = out.as_slice();
            assert_eq!(read_varint(&mut buf).unwrap(), value);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn truncated_varint_rejected() {
        let mut buf: &[u8] = &[0x80];
        assert!(matches!(
            read_varint(&mut buf),
            Err(BundleError::TruncatedVarint)
        ));
    }

    #[test]
    fn record_envelope_round_trip() {
        let records = vec![
            Record {
                id: 7,
                routing: "eu-west/crashes".to_string(),
                payload: vec![1, 2, 3],
            },
            Record {
                id: 300,
                routing: String::new(),
                payload: Vec::new(),
            },
        ];
        let encoded = encode_records(&records);
        assert_eq!(decode_records(&encoded).unwrap(), records);
    }

    #[test]
    fn record_overrun_rejected() {
        let mut out = Vec::new();
        write_varint(&mut out, 100); // declares 100 bytes, provides none
        assert!(matches!(
            decode_records(&out),
            Err(BundleError::RecordOverrun { .. })
        ));
    }

    #[test]
    fn bundle_parse_reads_header_and_entries() {
        let bundle = CrashBundle::parse(&sample_bundle_bytes()).unwrap();
        assert_eq!(bundle.directory_name, "abc");
        assert_eq!(bundle.file_name, "f");
        assert_eq!(bundle.uncompressed_size, 12);
        assert_eq!(bundle.files.len(), 1);
        assert_eq!(bundle.files[0].index, 0);
        assert_eq!(bundle.files[0].name, "x.txt");
        assert_eq!(bundle.files[0].data, b"hello world!");
    }

    #[test]
    fn missing_marker_is_unsupported_layout() {
        let mut bytes = sample_bundle_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            CrashBundle::parse(&bytes),
            Err(BundleError::UnsupportedLayout)
        ));
    }

    #[test]
    fn size_mismatch_rejected() {
        let mut out = Vec::new();
        out.extend_from_slice(BUNDLE_MARKER);
        push_string(&mut out, "abc");
        push_string(&mut out, "f");
        out.extend_from_slice(&99i32.to_le_bytes()); // wrong declared size
        out.extend_from_slice(&1i32.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        push_string(&mut out, "x.txt");
        out.extend_from_slice(&12i32.to_le_bytes());
        out.extend_from_slice(b"hello world!");

        assert!(matches!(
            CrashBundle::parse(&out),
            Err(BundleError::SizeMismatch {
                declared: 99,
                actual: 12
            })
        ));
    }

    #[test]
    fn unpack_writes_files_and_dupes_on_collision() {
        let tmp = TempDir::new().unwrap();
        let bundle = CrashBundle::parse(&sample_bundle_bytes()).unwrap();

        let first = bundle.unpack_into(tmp.path()).unwrap();
        assert_eq!(first, tmp.path().join("abc"));
        assert_eq!(fs::read(first.join("x.txt")).unwrap(), b"hello world!");

        let second = bundle.unpack_into(tmp.path()).unwrap();
        assert_eq!(second, tmp.path().join("abc_DUPE001"));
        assert_eq!(fs::read(second.join("x.txt")).unwrap(), b"hello world!");

        let third = bundle.unpack_into(tmp.path()).unwrap();
        assert_eq!(third, tmp.path().join("abc_DUPE002"));
    }

    #[test]
    fn unpack_rejects_traversal_names() {
        let tmp = TempDir::new().unwrap();
        let mut bundle = CrashBundle::parse(&sample_bundle_bytes()).unwrap();
        bundle.files[0].name = "../escape.txt".to_string();
        assert!(matches!(
            bundle.unpack_into(tmp.path()),
            Err(BundleError::UnsafeName(_))
        ));
    }

    #[test]
    fn zlib_round_trip_and_ceiling() {
        let payload = b"diagnostic data".repeat(100);
        let compressed = zlib_compress(&payload);
        assert_eq!(zlib_decompress(&compressed, 1 << 20).unwrap(), payload);
        assert!(matches!(
            zlib_decompress(&compressed, 16),
            Err(BundleError::TooLarge(16))
        ));
    }

    #[test]
    fn gzip_round_trip() {
        let payload = b"an envelope of records";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(gzip_decompress(&compressed, 1 << 20).unwrap(), payload);
    }

    #[test]
    fn envelope_to_files_end_to_end() {
        // Compressed record payload -> zlib -> CR1 bundle -> files on disk.
        let tmp = TempDir::new().unwrap();
        let record = Record {
            id: 1,
            routing: "bucket/key".to_string(),
            payload: zlib_compress(&sample_bundle_bytes()),
        };
        let envelope = encode_records(&[record]);

        let records = decode_records(&envelope).unwrap();
        assert_eq!(records.len(), 1);
        let payload = zlib_decompress(&records[0].payload, MAX_DECOMPRESSED_BYTES).unwrap();
        let bundle = CrashBundle::parse(&payload).unwrap();
        let dir = bundle.unpack_into(tmp.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.join("x.txt")).unwrap(),
            "hello world!"
        );
    }
}
