//! Header-level image recognition.
//!
//! A payload counts as an image when it carries a known format signature and a
//! readable header with non-zero dimensions. Pixel data is never decoded.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Bmp,
    Gif,
    Ico,
    Jpeg,
    Png,
    Tiff,
    Webp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Identify an image and read its dimensions from the header.
pub fn probe(data: &[u8]) -> Option<ImageInfo> {
    let (format, (width, height)) = if data.starts_with(PNG_SIGNATURE) {
        (ImageFormat::Png, png_dimensions(data)?)
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        (ImageFormat::Gif, gif_dimensions(data)?)
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        (ImageFormat::Jpeg, jpeg_dimensions(data)?)
    } else if data.starts_with(b"BM") {
        (ImageFormat::Bmp, bmp_dimensions(data)?)
    } else if data.starts_with(b"RIFF") && data.get(8..12) == Some(&b"WEBP"[..]) {
        (ImageFormat::Webp, webp_dimensions(data)?)
    } else if data.starts_with(b"II*\0") {
        (ImageFormat::Tiff, tiff_dimensions(data, Endian::Little)?)
    } else if data.starts_with(b"MM\0*") {
        (ImageFormat::Tiff, tiff_dimensions(data, Endian::Big)?)
    } else if data.starts_with(&[0, 0, 1, 0]) {
        (ImageFormat::Ico, ico_dimensions(data)?)
    } else {
        return None;
    };

    (width > 0 && height > 0).then_some(ImageInfo {
        format,
        width,
        height,
    })
}

#[derive(Debug, Clone, Copy)]
enum Endian {
    Big,
    Little,
}

impl Endian {
    fn u16(self, data: &[u8], at: usize) -> Option<u16> {
        let bytes: [u8; 2] = data.get(at..at + 2)?.try_into().ok()?;
        Some(match self {
            Endian::Big => u16::from_be_bytes(bytes),
            Endian::Little => u16::from_le_bytes(bytes),
        })
    }

    fn u32(self, data: &[u8], at: usize) -> Option<u32> {
        let bytes: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
        Some(match self {
            Endian::Big => u32::from_be_bytes(bytes),
            Endian::Little => u32::from_le_bytes(bytes),
        })
    }
}

fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.get(12..16)? != b"IHDR" {
        return None;
    }
    Some((Endian::Big.u32(data, 16)?, Endian::Big.u32(data, 20)?))
}

fn gif_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    Some((
        Endian::Little.u16(data, 6)? as u32,
        Endian::Little.u16(data, 8)? as u32,
    ))
}

fn bmp_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let header_size = Endian::Little.u32(data, 14)?;
    if header_size == 12 {
        // OS/2 BITMAPCOREHEADER
        return Some((
            Endian::Little.u16(data, 18)? as u32,
            Endian::Little.u16(data, 20)? as u32,
        ));
    }
    if header_size < 40 {
        return None;
    }
    let width = Endian::Little.u32(data, 18)? as i32;
    // Negative height means a top-down bitmap
    let height = Endian::Little.u32(data, 22)? as i32;
    Some((width.unsigned_abs(), height.unsigned_abs()))
}

fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2;
    loop {
        if *data.get(pos)? != 0xFF {
            return None;
        }
        while *data.get(pos)? == 0xFF {
            pos += 1;
        }
        let marker = *data.get(pos)?;
        pos += 1;

        match marker {
            // Standalone markers carry no length
            0x01 | 0xD0..=0xD8 => continue,
            // End of image or start of scan before any frame header
            0xD9 | 0xDA => return None,
            // SOF0..SOF15, excluding DHT, JPG and DAC
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                let height = Endian::Big.u16(data, pos + 3)? as u32;
                let width = Endian::Big.u16(data, pos + 5)? as u32;
                return Some((width, height));
            }
            _ => {
                let len = Endian::Big.u16(data, pos)? as usize;
                if len < 2 {
                    return None;
                }
                pos += len;
            }
        }
    }
}

fn webp_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    match data.get(12..16)? {
        b"VP8 " => {
            if data.get(23..26)? != [0x9D, 0x01, 0x2A] {
                return None;
            }
            let width = Endian::Little.u16(data, 26)? & 0x3FFF;
            let height = Endian::Little.u16(data, 28)? & 0x3FFF;
            Some((width as u32, height as u32))
        }
        b"VP8L" => {
            if *data.get(20)? != 0x2F {
                return None;
            }
            let bits = Endian::Little.u32(data, 21)?;
            Some(((bits & 0x3FFF) + 1, ((bits >> 14) & 0x3FFF) + 1))
        }
        b"VP8X" => {
            let width = Endian::Little.u32(data, 24)? & 0x00FF_FFFF;
            let height = Endian::Little.u32(data, 27)? & 0x00FF_FFFF;
            Some((width + 1, height + 1))
        }
        _ => None,
    }
}

fn tiff_dimensions(data: &[u8], endian: Endian) -> Option<(u32, u32)> {
    const IMAGE_WIDTH: u16 = 256;
    const IMAGE_LENGTH: u16 = 257;
    const SHORT: u16 = 3;
    const LONG: u16 = 4;

    let ifd = endian.u32(data, 4)? as usize;
    let count = endian.u16(data, ifd)? as usize;

    let mut width = None;
    let mut height = None;
    for i in 0..count {
        let entry = ifd + 2 + i * 12;
        let tag = endian.u16(data, entry)?;
        let value = match endian.u16(data, entry + 2)? {
            SHORT => endian.u16(data, entry + 8)? as u32,
            LONG => endian.u32(data, entry + 8)?,
            _ => continue,
        };
        match tag {
            IMAGE_WIDTH => width = Some(value),
            IMAGE_LENGTH => height = Some(value),
            _ => {}
        }
        if width.is_some() && height.is_some() {
            break;
        }
    }
    Some((width?, height?))
}

fn ico_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if Endian::Little.u16(data, 4)? == 0 || data.len() < 6 + 16 {
        return None;
    }
    // A stored size of 0 means 256 pixels
    let side = |b: u8| if b == 0 { 256 } else { b as u32 };
    Some((side(data[6]), side(data[7])))
}
