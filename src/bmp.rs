use std::path::Path;

use thiserror::Error;

use crate::snapshot::persist;

pub const FILE_HEADER_LEN: usize = 14;
pub const INFO_HEADER_LEN: usize = 40;
/// Pixel data starts right after both headers (no palette for 24 bpp).
pub const PIXEL_OFFSET: u32 = (FILE_HEADER_LEN + INFO_HEADER_LEN) as u32;

const BYTES_PER_PIXEL: usize = 3;
const PELS_PER_METER: i32 = 2835; // ~72 DPI

#[derive(Debug, Error)]
pub enum BmpError {
    #[error("invalid bitmap dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("{width}x{height} image does not fit in a BMP file")]
    TooLarge { width: u32, height: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// BITMAPFILEHEADER, 14 bytes on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitmapFileHeader {
    pub size: u32,
    pub reserved1: u16,
    pub reserved2: u16,
    pub off_bits: u32,
}

impl BitmapFileHeader {
    pub const MAGIC: [u8; 2] = *b"BM";

    /// `None` if the file size does not fit the 32-bit size field.
    fn for_payload(payload_len: u32) -> Option<Self> {
        Some(Self {
            size: PIXEL_OFFSET.checked_add(payload_len)?,
            reserved1: 0,
            reserved2: 0,
            off_bits: PIXEL_OFFSET,
        })
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&Self::MAGIC); // signature
        buf.extend_from_slice(&self.size.to_le_bytes()); // file size
        buf.extend_from_slice(&self.reserved1.to_le_bytes());
        buf.extend_from_slice(&self.reserved2.to_le_bytes());
        buf.extend_from_slice(&self.off_bits.to_le_bytes()); // pixel data offset
    }
}

/// BITMAPINFOHEADER, 40 bytes on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitmapInfoHeader {
    pub width: i32,
    pub height: i32,
    pub planes: u16,
    pub bit_count: u16,
    pub compression: u32,
    pub size_image: u32,
    pub x_pels_per_meter: i32,
    pub y_pels_per_meter: i32,
    pub clr_used: u32,
    pub clr_important: u32,
}

impl BitmapInfoHeader {
    /// Uncompressed 24 bpp, rows stored top-down (negative height).
    pub fn top_down_bgr24(width: i32, height: i32) -> Self {
        Self {
            width,
            height: -height,
            planes: 1,
            bit_count: 24,
            compression: 0, // BI_RGB
            size_image: 0,  // allowed for BI_RGB
            x_pels_per_meter: PELS_PER_METER,
            y_pels_per_meter: PELS_PER_METER,
            clr_used: 0,
            clr_important: 0,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(INFO_HEADER_LEN as u32).to_le_bytes()); // header size
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.planes.to_le_bytes());
        buf.extend_from_slice(&self.bit_count.to_le_bytes());
        buf.extend_from_slice(&self.compression.to_le_bytes());
        buf.extend_from_slice(&self.size_image.to_le_bytes());
        buf.extend_from_slice(&self.x_pels_per_meter.to_le_bytes());
        buf.extend_from_slice(&self.y_pels_per_meter.to_le_bytes());
        buf.extend_from_slice(&self.clr_used.to_le_bytes());
        buf.extend_from_slice(&self.clr_important.to_le_bytes());
    }
}

/// Serialize both headers for a `width` x `height` BGR24 payload.
///
/// Validates the dimensions against the buffer length first; nothing is
/// clamped or padded.
pub fn encode_headers(width: u32, height: u32, pixels_len: usize) -> Result<Vec<u8>, BmpError> {
    if width == 0 || height == 0 {
        return Err(BmpError::InvalidDimensions { width, height });
    }

    let signed_width = i32::try_from(width).map_err(|_| too_large_of(width, height))?;
    let signed_height = i32::try_from(height).map_err(|_| too_large_of(width, height))?;
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(BYTES_PER_PIXEL))
        .ok_or_else(|| too_large_of(width, height))?;
    if pixels_len != expected {
        return Err(BmpError::BufferSize {
            expected,
            actual: pixels_len,
        });
    }
    let file_header = u32::try_from(expected)
        .ok()
        .and_then(BitmapFileHeader::for_payload)
        .ok_or_else(|| too_large_of(width, height))?;

    let mut buf = Vec::with_capacity(PIXEL_OFFSET as usize);
    file_header.write_to(&mut buf);
    BitmapInfoHeader::top_down_bgr24(signed_width, signed_height).write_to(&mut buf);
    debug_assert_eq!(buf.len(), PIXEL_OFFSET as usize);
    Ok(buf)
}

fn too_large_of(width: u32, height: u32) -> BmpError {
    BmpError::TooLarge { width, height }
}

/// Write a BGR24 image as an uncompressed, top-down BMP file.
///
/// `pixels` must hold exactly `width * height * 3` bytes in blue-green-red
/// order with no row padding. The file is assembled next to `path` and
/// renamed into place, so a failed write never leaves a partial image.
pub fn write_bitmap(path: &Path, pixels: &[u8], width: u32, height: u32) -> Result<(), BmpError> {
    let header = encode_headers(width, height, pixels.len())?;
    persist(path, &[header.as_slice(), pixels])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn le_i32(bytes: &[u8], at: usize) -> i32 {
        i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn le_u16(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
    }

    #[test]
    fn two_by_two_black_image_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.bmp");
        write_bitmap(&path, &[0u8; 12], 2, 2).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 66);
        assert_eq!(&bytes[0..2], &[0x42, 0x4D]);
        assert_eq!(&bytes[2..6], &[66, 0, 0, 0]);
        assert_eq!(&bytes[6..10], &[0, 0, 0, 0]);
        assert_eq!(le_u32(&bytes, 10), 54);
        assert_eq!(&bytes[14..18], &[40, 0, 0, 0]);
        assert_eq!(&bytes[18..22], &[2, 0, 0, 0]);
        assert_eq!(&bytes[22..26], &(-2i32).to_le_bytes());
        assert_eq!(&bytes[22..26], &[0xFE, 0xFF, 0xFF, 0xFF]);
        assert!(bytes[54..].iter().all(|&b| b == 0));
    }

    #[test]
    fn info_header_fields() {
        let header = encode_headers(7, 5, 7 * 5 * 3).unwrap();
        assert_eq!(header.len(), 54);
        assert_eq!(le_u32(&header, 2), 54 + 105);
        assert_eq!(le_i32(&header, 18), 7);
        assert_eq!(le_i32(&header, 22), -5);
        assert_eq!(le_u16(&header, 26), 1); // planes
        assert_eq!(le_u16(&header, 28), 24); // bit count
        assert_eq!(le_u32(&header, 30), 0); // compression
        assert_eq!(le_u32(&header, 46), 0); // colors used
        assert_eq!(le_u32(&header, 50), 0); // important colors
    }

    #[test]
    fn one_pixel_file_is_57_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.bmp");
        write_bitmap(&path, &[1, 2, 3], 1, 1).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 57);
        assert_eq!(le_u32(&bytes, 2), 57);
        assert_eq!(&bytes[54..], &[1, 2, 3]);
    }

    #[test]
    fn sizes_follow_payload() {
        for (w, h) in [(1u32, 1u32), (3, 1), (1, 9), (640, 480), (33, 17)] {
            let len = (w * h * 3) as usize;
            let header = encode_headers(w, h, len).unwrap();
            assert_eq!(&header[0..2], b"BM");
            assert_eq!(le_u32(&header, 10), 54);
            assert_eq!(le_u32(&header, 2) as usize, 54 + len, "{w}x{h}");
        }
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(matches!(
            encode_headers(0, 4, 0),
            Err(BmpError::InvalidDimensions { width: 0, height: 4 })
        ));
        assert!(matches!(
            encode_headers(4, 0, 0),
            Err(BmpError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn rejects_wrong_buffer_length_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bmp");
        let err = write_bitmap(&path, &[0u8; 11], 2, 2).unwrap_err();
        assert!(matches!(
            err,
            BmpError::BufferSize {
                expected: 12,
                actual: 11
            }
        ));
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn rejects_dimensions_beyond_i32() {
        let err = encode_headers(u32::MAX, 1, 0).unwrap_err();
        assert!(matches!(err, BmpError::TooLarge { .. }));
    }

    #[test]
    fn file_size_overflow_is_refused() {
        assert_eq!(BitmapFileHeader::for_payload(u32::MAX), None);
        assert_eq!(BitmapFileHeader::for_payload(u32::MAX - PIXEL_OFFSET + 1), None);
        let largest = BitmapFileHeader::for_payload(u32::MAX - PIXEL_OFFSET).unwrap();
        assert_eq!(largest.size, u32::MAX);
        assert_eq!(largest.off_bits, 54);
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("frame.bmp");
        let err = write_bitmap(&path, &[0u8; 3], 1, 1).unwrap_err();
        assert!(matches!(err, BmpError::Io(_)));
        assert!(!path.exists());
    }

    #[test]
    fn rewriting_same_path_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("same.bmp");
        let pixels: Vec<u8> = (0..4 * 3 * 3).map(|i| i as u8).collect();

        write_bitmap(&path, &pixels, 4, 3).unwrap();
        let first = std::fs::read(&path).unwrap();
        write_bitmap(&path, &pixels, 4, 3).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn standard_reader_round_trip() {
        // 4 px wide keeps rows 4-byte aligned, so strict readers agree on the layout.
        let (width, height) = (4u32, 3u32);
        let rgb: Vec<u8> = (0..width * height)
            .flat_map(|i| {
                let i = i as u8;
                [i.wrapping_mul(20), 255 - i, i.wrapping_mul(7)]
            })
            .collect();
        let bgr: Vec<u8> = rgb.chunks(3).flat_map(|p| [p[2], p[1], p[0]]).collect();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round.bmp");
        write_bitmap(&path, &bgr, width, height).unwrap();

        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (width, height));
        assert_eq!(decoded.into_raw(), rgb);
    }
}
