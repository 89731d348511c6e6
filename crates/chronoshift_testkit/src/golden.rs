//! Golden byte layouts of the persisted formats.
//!
//! Each function spells out a format field by field, independently of the
//! engine's encoders, so a test can compare what the engine writes against
//! what older files on disk look like.

use chronoshift_core::{compute_crc32, FileVersion, Token};

/// Op tag of a delete edit.
pub const DELETE_TAG: u8 = 1;

/// Op tag of a replace edit.
pub const REPLACE_TAG: u8 = 2;

/// Segment data file magic.
pub const SEGMENT_MAGIC: &[u8; 4] = b"CSEG";

/// Index file magic.
pub const INDEX_MAGIC: &[u8; 4] = b"CIDX";

/// Segment terminator.
pub const SEGMENT_EOF: [u8; 4] = [0xFF; 4];

/// Payload of a delete edit: tag then token.
pub fn delete_payload(token: Token) -> Vec<u8> {
    let mut buf = vec![DELETE_TAG];
    buf.extend_from_slice(&token.to_le_bytes());
    buf
}

/// One entry-log record.
///
/// ```text
/// | len (4) | version (1) | sequence (8) | payload (len) | crc32 (4) |
/// ```
pub fn entry_record(sequence: u64, version: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.push(version);
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Header of a segment data file.
pub fn segment_header(segment: u64) -> Vec<u8> {
    let mut buf = SEGMENT_MAGIC.to_vec();
    buf.push(1);
    buf.extend_from_slice(&segment.to_le_bytes());
    buf
}

/// A complete index file for aggregates given in ascending id order.
pub fn index_file(file_version: FileVersion, aggregates: &[(&str, &[(u64, u32)])]) -> Vec<u8> {
    let directory_len: usize = aggregates.iter().map(|(id, _)| 2 + id.len() + 8 + 4).sum();
    let mut buf = INDEX_MAGIC.to_vec();
    buf.push(1);
    buf.extend_from_slice(&file_version.segment.to_le_bytes());
    buf.extend_from_slice(&file_version.version.to_le_bytes());
    buf.extend_from_slice(&(aggregates.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(directory_len as u32).to_le_bytes());

    let mut offset = (25 + directory_len) as u64;
    for (id, entries) in aggregates {
        buf.extend_from_slice(&(id.len() as u16).to_le_bytes());
        buf.extend_from_slice(id.as_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        offset += entries.len() as u64 * 12;
    }
    for (_, entries) in aggregates {
        for (sequence, position) in *entries {
            buf.extend_from_slice(&sequence.to_le_bytes());
            buf.extend_from_slice(&position.to_le_bytes());
        }
    }
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_event;
    use chronoshift_core::index::{encode_index, IndexEntries, IndexEntry, SegmentIndexEntries};
    use chronoshift_core::transformation::ENTRY_FORMAT_VERSION;
    use chronoshift_core::{EntryOp, SegmentWriter, StorageConfig, TransformationEntry, TransformationEntryStore};
    use chronoshift_storage::InMemoryBackend;

    #[test]
    fn test_delete_entry_layout() {
        let bytes = InMemoryBackend::new();
        let store = TransformationEntryStore::with_backend(Box::new(bytes.clone()), &StorageConfig::default())
            .unwrap();
        store.store(&TransformationEntry::delete(0, 42).unwrap()).unwrap();
        store.store(&TransformationEntry::delete(1, 43).unwrap()).unwrap();

        let mut expected = entry_record(0, ENTRY_FORMAT_VERSION, &delete_payload(42));
        expected.extend(entry_record(1, ENTRY_FORMAT_VERSION, &delete_payload(43)));
        assert_eq!(bytes.data(), expected);
        assert_eq!(expected.len(), 2 * 26);
    }

    #[test]
    fn test_replace_payload_starts_with_tag_and_token() {
        let entry = TransformationEntry::new(
            0,
            &EntryOp::Replace {
                token: 7,
                event: sample_event("a", 0),
            },
        )
        .unwrap();
        assert_eq!(entry.payload[0], REPLACE_TAG);
        assert_eq!(entry.payload[1..9], 7u64.to_le_bytes());
    }

    #[test]
    fn test_segment_framing() {
        let bytes = InMemoryBackend::new();
        let mut writer = SegmentWriter::create(Box::new(bytes.clone()), 100).unwrap();
        writer.append(&[sample_event("a", 0)]).unwrap();
        writer.finish(false).unwrap();

        let data = bytes.data();
        assert!(data.starts_with(&segment_header(100)));
        assert!(data.ends_with(&SEGMENT_EOF));
    }

    #[test]
    fn test_index_layout() {
        let mut entries = SegmentIndexEntries::new();
        entries.insert(
            "a".to_string(),
            IndexEntries::from_entries(vec![IndexEntry::new(0, 13), IndexEntry::new(1, 40)]),
        );
        entries.insert("bb".to_string(), IndexEntries::from_entries(vec![IndexEntry::new(5, 90)]));

        let version = FileVersion::new(100, 2);
        let a: &[(u64, u32)] = &[(0, 13), (1, 40)];
        let bb: &[(u64, u32)] = &[(5, 90)];
        let expected = index_file(version, &[("a", a), ("bb", bb)]);
        assert_eq!(encode_index(version, &entries).unwrap(), expected);
    }
}
