use std::convert::TryInto;

/// Marker binary format
///
/// Every record in a datafile is a marker: a variable-size, 8-byte
/// aligned blob starting with a fixed common header (all integers
/// little-endian):
///
/// ```text
/// offset  0: size  (u32)  total marker size, excluding alignment padding
/// offset  4: type  (u32)  marker type tag
/// offset  8: crc   (u32)  CRC32 over the whole marker, crc field zeroed
/// offset 12: tick  (u64)  tick at which the marker was written
/// ```
///
/// Document markers append document id, revision id and shape id,
/// followed by the opaque body; edge markers additionally carry the
/// from/to collection and document ids. Deletion markers carry just the
/// document id. Each file starts with a header marker (collection id,
/// format version) and, once sealed, ends with a footer marker.

pub const MARKER_ALIGNMENT: u32 = 8;

pub const COMMON_HEADER_SIZE: u32 = 20;
pub const DOCUMENT_PREFIX_SIZE: u32 = 40;
pub const EDGE_PREFIX_SIZE: u32 = 72;
pub const DELETION_MARKER_SIZE: u32 = 28;
pub const FILE_HEADER_SIZE: u32 = 32;
pub const FILE_FOOTER_SIZE: u32 = 20;

pub const DATAFILE_VERSION: u32 = 1;

const OFF_SIZE: usize = 0;
const OFF_TYPE: usize = 4;
const OFF_CRC: usize = 8;
const OFF_TICK: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerType {
    FileHeader,
    FileFooter,
    Document,
    Edge,
    Deletion,
}

impl MarkerType {
    pub fn tag(self) -> u32 {
        match self {
            MarkerType::FileHeader => 1,
            MarkerType::FileFooter => 2,
            MarkerType::Document => 3,
            MarkerType::Edge => 4,
            MarkerType::Deletion => 5,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(MarkerType::FileHeader),
            2 => Some(MarkerType::FileFooter),
            3 => Some(MarkerType::Document),
            4 => Some(MarkerType::Edge),
            5 => Some(MarkerType::Deletion),
            _ => None,
        }
    }
}

/// Round a marker size up to the next alignment boundary.
pub fn align_size(size: u32) -> u32 {
    (size + MARKER_ALIGNMENT - 1) & !(MARKER_ALIGNMENT - 1)
}

/// The edge endpoints stored in an edge marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRelation {
    pub from_cid: u64,
    pub from_did: u64,
    pub to_cid: u64,
    pub to_did: u64,
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_common(prefix: &mut [u8], size: u32, marker_type: MarkerType, tick: u64) {
    put_u32(prefix, OFF_SIZE, size);
    put_u32(prefix, OFF_TYPE, marker_type.tag());
    put_u32(prefix, OFF_CRC, 0);
    put_u64(prefix, OFF_TICK, tick);
}

/// Compute the CRC of a marker split into prefix and body, and store it
/// in the prefix. The CRC field must be zero when this is called.
pub fn fill_crc(prefix: &mut [u8], body: &[u8]) {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(prefix);
    hasher.update(body);
    let crc = hasher.finalize();
    put_u32(prefix, OFF_CRC, crc);
}

/// Encode a document marker prefix; the body follows the prefix on disk.
pub fn document_prefix(tick: u64, did: u64, rid: u64, shape: u32, body: &[u8]) -> [u8; DOCUMENT_PREFIX_SIZE as usize] {
    let mut prefix = [0u8; DOCUMENT_PREFIX_SIZE as usize];
    put_common(&mut prefix, DOCUMENT_PREFIX_SIZE + body.len() as u32, MarkerType::Document, tick);
    put_u64(&mut prefix, 20, did);
    put_u64(&mut prefix, 28, rid);
    put_u32(&mut prefix, 36, shape);
    fill_crc(&mut prefix, body);
    prefix
}

/// Encode an edge marker prefix; the body follows the prefix on disk.
pub fn edge_prefix(tick: u64, did: u64, rid: u64, shape: u32, edge: &EdgeRelation, body: &[u8]) -> [u8; EDGE_PREFIX_SIZE as usize] {
    let mut prefix = [0u8; EDGE_PREFIX_SIZE as usize];
    put_common(&mut prefix, EDGE_PREFIX_SIZE + body.len() as u32, MarkerType::Edge, tick);
    put_u64(&mut prefix, 20, did);
    put_u64(&mut prefix, 28, rid);
    put_u32(&mut prefix, 36, shape);
    put_u64(&mut prefix, 40, edge.from_cid);
    put_u64(&mut prefix, 48, edge.from_did);
    put_u64(&mut prefix, 56, edge.to_cid);
    put_u64(&mut prefix, 64, edge.to_did);
    fill_crc(&mut prefix, body);
    prefix
}

/// Encode a deletion marker.
pub fn deletion_marker(tick: u64, did: u64) -> [u8; DELETION_MARKER_SIZE as usize] {
    let mut marker = [0u8; DELETION_MARKER_SIZE as usize];
    put_common(&mut marker, DELETION_MARKER_SIZE, MarkerType::Deletion, tick);
    put_u64(&mut marker, 20, did);
    fill_crc(&mut marker, &[]);
    marker
}

/// Encode the header marker that opens every datafile.
pub fn file_header_marker(fid: u64, cid: u64) -> [u8; FILE_HEADER_SIZE as usize] {
    let mut marker = [0u8; FILE_HEADER_SIZE as usize];
    put_common(&mut marker, FILE_HEADER_SIZE, MarkerType::FileHeader, fid);
    put_u64(&mut marker, 20, cid);
    put_u32(&mut marker, 28, DATAFILE_VERSION);
    fill_crc(&mut marker, &[]);
    marker
}

/// Encode the footer marker that closes a sealed datafile.
pub fn file_footer_marker(tick: u64) -> [u8; FILE_FOOTER_SIZE as usize] {
    let mut marker = [0u8; FILE_FOOTER_SIZE as usize];
    put_common(&mut marker, FILE_FOOTER_SIZE, MarkerType::FileFooter, tick);
    fill_crc(&mut marker, &[]);
    marker
}

/// A validated view onto one marker inside a datafile.
#[derive(Clone, Copy)]
pub struct MarkerRef<'a> {
    bytes: &'a [u8],
}

/// The document fields of a document or edge marker.
pub struct DocumentView<'a> {
    pub did: u64,
    pub rid: u64,
    pub shape: u32,
    pub body: &'a [u8],
}

pub struct EdgeView<'a> {
    pub document: DocumentView<'a>,
    pub edge: EdgeRelation,
}

pub struct FileHeaderView {
    pub cid: u64,
    pub version: u32,
}

impl<'a> MarkerRef<'a> {
    /// Parse the marker starting at the beginning of `data`. Returns
    /// `None` for anything that cannot be a marker: zero or undersized
    /// size field, size beyond the available data, unknown type tag, or
    /// a size smaller than the fixed layout of the claimed type.
    pub fn parse(data: &'a [u8]) -> Option<MarkerRef<'a>> {
        if data.len() < COMMON_HEADER_SIZE as usize {
            return None;
        }
        let size = read_u32(data, OFF_SIZE);
        if size < COMMON_HEADER_SIZE || size as usize > data.len() {
            return None;
        }
        let marker_type = MarkerType::from_tag(read_u32(data, OFF_TYPE))?;
        let minimum = match marker_type {
            MarkerType::FileHeader => FILE_HEADER_SIZE,
            MarkerType::FileFooter => FILE_FOOTER_SIZE,
            MarkerType::Document => DOCUMENT_PREFIX_SIZE,
            MarkerType::Edge => EDGE_PREFIX_SIZE,
            MarkerType::Deletion => DELETION_MARKER_SIZE,
        };
        if size < minimum {
            return None;
        }
        Some(MarkerRef { bytes: &data[..size as usize] })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn size(&self) -> u32 {
        read_u32(self.bytes, OFF_SIZE)
    }

    pub fn marker_type(&self) -> MarkerType {
        MarkerType::from_tag(read_u32(self.bytes, OFF_TYPE)).unwrap()
    }

    pub fn crc(&self) -> u32 {
        read_u32(self.bytes, OFF_CRC)
    }

    pub fn tick(&self) -> u64 {
        read_u64(self.bytes, OFF_TICK)
    }

    /// Offset of the opaque body within the marker, if it has one.
    pub fn body_offset(&self) -> Option<u32> {
        match self.marker_type() {
            MarkerType::Document => Some(DOCUMENT_PREFIX_SIZE),
            MarkerType::Edge => Some(EDGE_PREFIX_SIZE),
            _ => None,
        }
    }

    /// Recompute the CRC with the stored CRC field treated as zero.
    pub fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.bytes[..OFF_CRC]);
        hasher.update(&[0u8; 4]);
        hasher.update(&self.bytes[OFF_CRC + 4..]);
        hasher.finalize()
    }

    pub fn check_crc(&self) -> bool {
        self.compute_crc() == self.crc()
    }

    pub fn document(&self) -> Option<DocumentView<'a>> {
        let body_offset = self.body_offset()? as usize;
        Some(DocumentView {
            did: read_u64(self.bytes, 20),
            rid: read_u64(self.bytes, 28),
            shape: read_u32(self.bytes, 36),
            body: &self.bytes[body_offset..],
        })
    }

    pub fn edge(&self) -> Option<EdgeView<'a>> {
        if self.marker_type() != MarkerType::Edge {
            return None;
        }
        Some(EdgeView {
            document: self.document()?,
            edge: EdgeRelation {
                from_cid: read_u64(self.bytes, 40),
                from_did: read_u64(self.bytes, 48),
                to_cid: read_u64(self.bytes, 56),
                to_did: read_u64(self.bytes, 64),
            },
        })
    }

    pub fn deletion_did(&self) -> Option<u64> {
        if self.marker_type() != MarkerType::Deletion {
            return None;
        }
        Some(read_u64(self.bytes, 20))
    }

    pub fn file_header(&self) -> Option<FileHeaderView> {
        if self.marker_type() != MarkerType::FileHeader {
            return None;
        }
        Some(FileHeaderView {
            cid: read_u64(self.bytes, 20),
            version: read_u32(self.bytes, 28),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_marker_layout() {
        let body = br#"{"x":1}"#;
        let prefix = document_prefix(99, 7, 8, 42, body);

        let mut raw = prefix.to_vec();
        raw.extend_from_slice(body);

        let marker = MarkerRef::parse(&raw).unwrap();
        assert_eq!(marker.size(), 40 + body.len() as u32);
        assert_eq!(marker.marker_type(), MarkerType::Document);
        assert_eq!(marker.tick(), 99);
        assert!(marker.check_crc());

        let doc = marker.document().unwrap();
        assert_eq!(doc.did, 7);
        assert_eq!(doc.rid, 8);
        assert_eq!(doc.shape, 42);
        assert_eq!(doc.body, body);
    }

    #[test]
    fn edge_marker_layout() {
        let body = b"edge-body";
        let relation = EdgeRelation { from_cid: 1, from_did: 2, to_cid: 3, to_did: 4 };
        let prefix = edge_prefix(100, 10, 11, 5, &relation, body);

        let mut raw = prefix.to_vec();
        raw.extend_from_slice(body);

        let marker = MarkerRef::parse(&raw).unwrap();
        assert_eq!(marker.marker_type(), MarkerType::Edge);
        assert!(marker.check_crc());

        let edge = marker.edge().unwrap();
        assert_eq!(edge.edge, relation);
        assert_eq!(edge.document.body, body);
        assert_eq!(marker.body_offset(), Some(EDGE_PREFIX_SIZE));
    }

    #[test]
    fn crc_detects_corruption() {
        let body = b"payload";
        let prefix = document_prefix(1, 2, 3, 4, body);
        let mut raw = prefix.to_vec();
        raw.extend_from_slice(body);

        // flip one bit in the body
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        let marker = MarkerRef::parse(&raw).unwrap();
        assert!(!marker.check_crc());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(MarkerRef::parse(&[]).is_none());
        assert!(MarkerRef::parse(&[0u8; 32]).is_none());

        // valid header but truncated data
        let marker = deletion_marker(5, 6);
        assert!(MarkerRef::parse(&marker[..20]).is_none());

        // unknown type tag
        let mut raw = deletion_marker(5, 6).to_vec();
        raw[4] = 0xff;
        assert!(MarkerRef::parse(&raw).is_none());
    }

    #[test]
    fn alignment() {
        assert_eq!(align_size(20), 24);
        assert_eq!(align_size(24), 24);
        assert_eq!(align_size(28), 32);
        assert_eq!(align_size(47), 48);
        assert_eq!(align_size(DELETION_MARKER_SIZE), 32);
    }

    #[test]
    fn footer_and_header_roundtrip() {
        let header = file_header_marker(1234, 77);
        let marker = MarkerRef::parse(&header).unwrap();
        assert!(marker.check_crc());
        let view = marker.file_header().unwrap();
        assert_eq!(view.cid, 77);
        assert_eq!(view.version, DATAFILE_VERSION);

        let footer = file_footer_marker(5678);
        let marker = MarkerRef::parse(&footer).unwrap();
        assert_eq!(marker.marker_type(), MarkerType::FileFooter);
        assert!(marker.check_crc());
    }
}
