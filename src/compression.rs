//! Layer blob compression detection.
//!
//! Blobs are sniffed by their leading bytes rather than trusted media types,
//! so the same code path serves registry blobs and `docker save` layers.

use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use std::ops::Range;
use tar_rs as tar;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_BLOCK: usize = 512;
const CKSUM_FIELD: Range<usize> = 148..156;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

/// Identifies the compression of a blob from its first bytes.
///
/// Returns `None` when the bytes are neither a known compressed stream nor a
/// tar stream. `head` should hold at least one tar block when available.
pub fn detect(head: &[u8]) -> Option<Compression> {
    if head.starts_with(&GZIP_MAGIC) {
        return Some(Compression::Gzip);
    }
    if head.starts_with(&ZSTD_MAGIC) {
        return Some(Compression::Zstd);
    }
    if head.is_empty() {
        return Some(Compression::None);
    }
    if head.len() >= TAR_MAGIC_OFFSET + 5 && &head[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar" {
        return Some(Compression::None);
    }
    if head.len() < TAR_BLOCK {
        return None;
    }
    let block = &head[..TAR_BLOCK];
    // An archive holding only its end-of-archive marker.
    if block.iter().all(|b| *b == 0) {
        return Some(Compression::None);
    }
    // Pre-POSIX archives carry no magic; a valid header checksum is the only tell.
    if has_valid_checksum(block) {
        return Some(Compression::None);
    }
    None
}

/// Checks a tar header block against its stored checksum: the byte sum of
/// the block with the checksum field counted as spaces.
fn has_valid_checksum(block: &[u8]) -> bool {
    let Ok(stored) = tar::Header::from_byte_slice(block).cksum() else {
        return false;
    };
    let unsigned: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| if CKSUM_FIELD.contains(&i) { 0x20 } else { u32::from(*b) })
        .sum();
    let signed: i64 = block
        .iter()
        .enumerate()
        .map(|(i, b)| if CKSUM_FIELD.contains(&i) { 0x20 } else { i64::from(*b as i8) })
        .sum();
    stored == unsigned || i64::from(stored) == signed
}

/// Sniffs `reader` and wraps it in the matching decoder.
///
/// On failure the error string describes why the stream was rejected; callers
/// attach the layer digest.
pub fn decoded_reader<'a, R: Read + 'a>(mut reader: R) -> Result<Box<dyn Read + 'a>, String> {
    let mut head = Vec::with_capacity(TAR_BLOCK);
    (&mut reader)
        .take(TAR_BLOCK as u64)
        .read_to_end(&mut head)
        .map_err(|e| format!("failed to read layer header: {}", e))?;

    let kind = detect(&head).ok_or_else(|| "unrecognized compression format".to_string())?;
    log::trace!("Detected layer compression: {:?}", kind);

    let stream = Cursor::new(head).chain(reader);
    Ok(match kind {
        Compression::None => Box::new(stream),
        Compression::Gzip => Box::new(GzDecoder::new(stream)),
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::new(stream)
                .map_err(|e| format!("failed to initialise zstd decoder: {}", e))?,
        ),
    })
}
