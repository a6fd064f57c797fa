use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Algorithm, Crc};

use crate::errdata;
use crate::error::{Error, Result};

/// ASCII "EMBR".
pub const MAGIC: u32 = 0x454D_4252;

/// Bumped on any incompatible change to the image encoding. There is no
/// migration path; a mismatch refuses to open.
pub const FORMAT_VERSION: u16 = 1;

pub const LAYOUT_LEN: usize = 8;

// magic + format version + layout tag + payload length + checksum
pub const HEADER_SIZE: usize = 4 + 2 + LAYOUT_LEN + 8 + 8;

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

/// Fixed-size header in front of the pool image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolHeader {
    pub format_version: u16,
    pub layout: [u8; LAYOUT_LEN],
    pub payload_len: u64,
    pub checksum: u64,
}

impl PoolHeader {
    pub fn new(layout: [u8; LAYOUT_LEN], payload: &[u8]) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            layout,
            payload_len: payload.len() as u64,
            checksum: checksum(payload),
        }
    }

    pub fn encode(&self, mut writer: impl Write) -> Result<()> {
        writer.write_u32::<BigEndian>(MAGIC)?;
        writer.write_u16::<BigEndian>(self.format_version)?;
        writer.write_all(&self.layout)?;
        writer.write_u64::<BigEndian>(self.payload_len)?;
        writer.write_u64::<BigEndian>(self.checksum)?;
        Ok(())
    }

    pub fn decode(mut reader: impl Read) -> Result<Self> {
        let magic = reader
            .read_u32::<BigEndian>()
            .map_err(|_| Error::Corrupted("file too short for a pool header".into()))?;
        if magic != MAGIC {
            return Err(Error::Corrupted(format!("bad magic {magic:#010x}")));
        }

        let format_version = reader.read_u16::<BigEndian>()?;
        if format_version != FORMAT_VERSION {
            return Err(errdata!(
                "unsupported pool format version {format_version}, expected {FORMAT_VERSION}"
            ));
        }

        let mut layout = [0u8; LAYOUT_LEN];
        reader.read_exact(&mut layout)?;
        let payload_len = reader.read_u64::<BigEndian>()?;
        let checksum = reader.read_u64::<BigEndian>()?;

        Ok(Self {
            format_version,
            layout,
            payload_len,
            checksum,
        })
    }

    /// Verifies a payload against the recorded length and checksum.
    pub fn verify(&self, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 != self.payload_len {
            return Err(Error::Corrupted(format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                self.payload_len
            )));
        }
        let actual = checksum(payload);
        if actual != self.checksum {
            return Err(Error::Corrupted(format!(
                "checksum mismatch: computed {actual:#018x}, header says {:#018x}",
                self.checksum
            )));
        }
        Ok(())
    }
}

pub fn checksum(payload: &[u8]) -> u64 {
    Crc::<u64>::new(&CRC_64_ECMA).checksum(payload)
}

/// Pads or truncates a layout name into the fixed header field.
pub fn layout_tag(name: &str) -> [u8; LAYOUT_LEN] {
    let mut tag = [0u8; LAYOUT_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(LAYOUT_LEN);
    tag[..n].copy_from_slice(&bytes[..n]);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let payload = b"some pool image bytes";
        let header = PoolHeader::new(layout_tag("emberdb"), payload);

        let mut buf = Vec::with_capacity(HEADER_SIZE);
        header.encode(&mut buf).expect("encode failed");
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = PoolHeader::decode(&buf[..]).expect("decode failed");
        assert_eq!(decoded, header);
        decoded.verify(payload).expect("payload should verify");
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let payload = b"x";
        let header = PoolHeader::new(layout_tag("emberdb"), payload);
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        buf[0] ^= 0xFF;

        match PoolHeader::decode(&buf[..]) {
            Err(Error::Corrupted(_)) => {}
            other => panic!("expected Corrupted, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let truncated = vec![0u8; HEADER_SIZE - 5];
        assert!(PoolHeader::decode(&truncated[..]).is_err());
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let header = PoolHeader::new(layout_tag("emberdb"), b"payload");
        assert!(header.verify(b"payloae").is_err());
        assert!(header.verify(b"payload-longer").is_err());
        header.verify(b"payload").unwrap();
    }

    #[test]
    fn test_layout_tag_pads_and_truncates() {
        assert_eq!(layout_tag("kv"), *b"kv\0\0\0\0\0\0");
        assert_eq!(layout_tag("much-too-long"), *b"much-too");
    }
}
