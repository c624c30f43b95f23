//! Length-prefixed, CRC-checked record streams.
//!
//! Each record is framed as
//! `u64 length (LE) | masked crc32 of length | payload | masked crc32 of payload`,
//! the same framing TensorBoard event files use. Partition files carry one
//! protobuf [`ExampleRecord`] per frame and can be read one record at a time.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::errors::{record, DataError, Result};

/// Wire schema of one tokenized example.
#[derive(Clone, PartialEq, Message)]
pub struct ExampleRecord {
    #[prost(uint64, tag = "1")]
    pub example_id: u64,
    #[prost(uint32, repeated, tag = "2")]
    pub input_ids: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub attention_mask: Vec<u32>,
    /// Root-to-leaf label ids; the last entry is the leaf.
    #[prost(uint32, repeated, tag = "4")]
    pub labels: Vec<u32>,
}

pub fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

pub struct RecordWriter<W: Write> {
    writer: W,
    written: usize,
}

impl RecordWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn write_record(&mut self, payload: &[u8]) -> io::Result<()> {
        let len_bytes = (payload.len() as u64).to_le_bytes();
        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(&masked_crc32(&len_bytes).to_le_bytes())?;
        self.writer.write_all(payload)?;
        self.writer.write_all(&masked_crc32(payload).to_le_bytes())?;
        self.written += 1;
        Ok(())
    }

    pub fn write_message<M: Message>(&mut self, message: &M) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(message.encoded_len());
        message
            .encode(&mut buffer)
            .map_err(|err| record(format!("failed to encode record: {err}")))?;
        self.write_record(&buffer)?;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Streaming reader over framed records. Yields raw payloads and stops at a
/// clean end of stream; a truncated frame or checksum mismatch is an error.
pub struct RecordReader<R: Read> {
    reader: R,
    position: usize,
}

impl RecordReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            position: 0,
        }
    }

    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 8];
        if !read_exact_or_eof(&mut self.reader, &mut len_bytes)? {
            return Ok(None);
        }
        let mut crc_bytes = [0u8; 4];
        self.reader.read_exact(&mut crc_bytes)?;
        if u32::from_le_bytes(crc_bytes) != masked_crc32(&len_bytes) {
            return Err(record(format!(
                "length checksum mismatch at record {}",
                self.position
            )));
        }

        let len = u64::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        self.reader.read_exact(&mut crc_bytes)?;
        if u32::from_le_bytes(crc_bytes) != masked_crc32(&payload) {
            return Err(record(format!(
                "payload checksum mismatch at record {}",
                self.position
            )));
        }
        self.position += 1;
        Ok(Some(payload))
    }

    pub fn next_message<M: Message + Default>(&mut self) -> Result<Option<M>> {
        match self.next_record()? {
            Some(payload) => M::decode(payload.as_slice())
                .map(Some)
                .map_err(|err| record(format!("failed to decode record: {err}"))),
            None => Ok(None),
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Fill `buf` completely, or return `false` if the stream ended before the
/// first byte. Ending part-way through is an error.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(DataError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated record header",
                )))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample(id: u64) -> ExampleRecord {
        ExampleRecord {
            example_id: id,
            input_ids: vec![1, 7, 9, 0],
            attention_mask: vec![1, 1, 1, 0],
            labels: vec![0, 3],
        }
    }

    #[test]
    fn streams_messages_in_write_order() {
        let mut writer = RecordWriter::new(Vec::new());
        for id in 0..3 {
            writer.write_message(&sample(id)).unwrap();
        }
        assert_eq!(writer.written(), 3);
        let bytes = writer.into_inner().unwrap();

        let mut reader = RecordReader::new(Cursor::new(bytes));
        let mut ids = Vec::new();
        while let Some(message) = reader.next_message::<ExampleRecord>().unwrap() {
            assert_eq!(message.labels, vec![0, 3]);
            ids.push(message.example_id);
        }
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn detects_corrupted_payload() {
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_message(&sample(5)).unwrap();
        let mut bytes = writer.into_inner().unwrap();
        bytes[14] ^= 0xff;

        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert!(matches!(reader.next_record(), Err(DataError::Record(_))));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_message(&sample(1)).unwrap();
        let mut bytes = writer.into_inner().unwrap();
        bytes.truncate(bytes.len() - 2);

        let mut reader = RecordReader::new(Cursor::new(bytes));
        assert!(reader.next_record().is_err());
    }
}
