//! Little-endian encoding helpers shared by the on-disk formats.

use crate::error::{CoreError, CoreResult};

/// Computes the CRC32 (IEEE) checksum used by every on-disk record.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

/// Appends a CRC32 of everything in `buf` so far.
pub(crate) fn seal(buf: &mut Vec<u8>) {
    let crc = compute_crc32(buf);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Splits off and verifies the trailing CRC32 of `bytes`.
pub(crate) fn unseal(bytes: &[u8]) -> CoreResult<&[u8]> {
    if bytes.len() < 4 {
        return Err(CoreError::invalid_format("record shorter than its checksum"));
    }
    let (body, tail) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let actual = compute_crc32(body);
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    Ok(body)
}

pub(crate) fn put_str(buf: &mut Vec<u8>, value: &str) -> CoreResult<()> {
    put_bytes(buf, value.as_bytes())
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| CoreError::invalid_operation(format!("field too large: {} bytes", value.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

/// A bounds-checked cursor over an encoded buffer.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    cursor: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8], what: &'static str) -> Self {
        Self {
            bytes,
            cursor: 0,
            what,
        }
    }

    pub(crate) fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                CoreError::invalid_format(format!(
                    "{}: unexpected end at byte {} (needed {len})",
                    self.what, self.cursor
                ))
            })?;
        let slice = &self.bytes[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> CoreResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub(crate) fn bytes(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn string(&mut self) -> CoreResult<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CoreError::invalid_format(format!("{}: invalid UTF-8", self.what)))
    }

    pub(crate) fn position(&self) -> usize {
        self.cursor
    }

    pub(crate) fn finish(&self) -> CoreResult<()> {
        if self.cursor != self.bytes.len() {
            return Err(CoreError::invalid_format(format!(
                "{}: {} trailing bytes",
                self.what,
                self.bytes.len() - self.cursor
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn seal_then_unseal() {
        let mut buf = b"payload".to_vec();
        seal(&mut buf);
        assert_eq!(unseal(&buf).unwrap(), b"payload");

        buf[0] ^= 1;
        assert!(matches!(unseal(&buf), Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn reader_detects_short_input() {
        let mut buf = Vec::new();
        put_str(&mut buf, "aggregate").unwrap();
        let mut reader = Reader::new(&buf[..6], "test");
        assert!(reader.string().is_err());

        let mut reader = Reader::new(&buf, "test");
        assert_eq!(reader.string().unwrap(), "aggregate");
        reader.finish().unwrap();
    }
}
