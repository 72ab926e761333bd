//! Small helpers shared across the crate: hex-ascii codecs, fixed-layout
//! "virtual file" read/write primitives used by the plugin surface, path
//! normalization and guest UTF-16 string decoding.

use crate::error::ExtStatus;
use widestring::U16String;

/// Decode a hex-ascii string (whitespace tolerated) into bytes.
/// An odd number of digits or a non-hex character yields `None`.
pub fn hexascii_to_bytes(s: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = s
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|b| match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => Err(()),
        })
        .collect::<Result<_, _>>()
        .ok()?;
    if digits.len() % 2 != 0 {
        return None;
    }
    Some(digits.chunks(2).map(|c| (c[0] << 4) | c[1]).collect())
}

pub fn bytes_to_hexascii(b: &[u8]) -> String {
    let mut s = String::with_capacity(b.len() * 2);
    for byte in b {
        s.push_str(&format!("{:02x}", byte));
    }
    s
}

/// Serve a read of `buf.len()` bytes at `offset` out of `src`, the way a
/// file-system backend would: reads past the end report `EndOfFile`.
pub fn vfs_read_from_buffer(src: &[u8], buf: &mut [u8], offset: u64) -> (usize, ExtStatus) {
    if offset >= src.len() as u64 {
        return (0, ExtStatus::EndOfFile);
    }
    let offset = offset as usize;
    let n = buf.len().min(src.len() - offset);
    buf[..n].copy_from_slice(&src[offset..offset + n]);
    (n, ExtStatus::Success)
}

/// Fixed-width hex rendering of a u64 ("0123456789abcdef").
pub fn vfs_read_u64_hex(value: u64, buf: &mut [u8], offset: u64) -> (usize, ExtStatus) {
    vfs_read_from_buffer(format!("{:016x}", value).as_bytes(), buf, offset)
}

pub fn vfs_read_u32_dec(value: u32, buf: &mut [u8], offset: u64) -> (usize, ExtStatus) {
    vfs_read_from_buffer(format!("{:10}", value).as_bytes(), buf, offset)
}

/// Parse a written numeric value, accepting decimal or `0x`-prefixed hex.
/// Offsets other than zero are treated as an overwrite of the rendered tail
/// and rejected: callers always re-write the whole value.
pub fn vfs_write_number(data: &[u8], offset: u64) -> Option<u64> {
    if offset != 0 {
        return None;
    }
    let s = std::str::from_utf8(data).ok()?.trim().trim_matches('\0');
    if s.is_empty() {
        return None;
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        // bare hex without prefix (the file renders bare hex)
        u64::from_str_radix(s, 16).ok()
    }
}

/// Parse a written address value. The backing files render bare hex, so
/// the digits are always interpreted as hex ("0x" prefix tolerated).
pub fn vfs_write_hex(data: &[u8], offset: u64) -> Option<u64> {
    if offset != 0 {
        return None;
    }
    let s = std::str::from_utf8(data).ok()?.trim().trim_matches('\0');
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

/// Parse a boolean write ("1"/"0", leading byte decides).
pub fn vfs_write_bool(data: &[u8]) -> Option<bool> {
    data.iter().find(|b| !b.is_ascii_whitespace()).map(|b| *b == b'1')
}

/// Serve a read over a virtual file made of fixed-width lines, one per
/// element, without materializing more than the requested window.
pub fn vfs_read_line_fixed<T>(
    items: &[T],
    line_len: usize,
    render: impl Fn(&T) -> String,
    buf: &mut [u8],
    offset: u64,
) -> (usize, ExtStatus) {
    let total = items.len() * line_len;
    if offset >= total as u64 {
        return (0, ExtStatus::EndOfFile);
    }
    let mut written = 0usize;
    let mut pos = offset as usize;
    while written < buf.len() && pos < total {
        let idx = pos / line_len;
        let line_off = pos % line_len;
        let mut line = render(&items[idx]);
        debug_assert!(line.len() < line_len);
        while line.len() < line_len - 1 {
            line.push(' ');
        }
        line.push('\n');
        let lb = line.as_bytes();
        let n = (buf.len() - written).min(line_len - line_off);
        buf[written..written + n].copy_from_slice(&lb[line_off..line_off + n]);
        written += n;
        pos += n;
    }
    (written, ExtStatus::Success)
}

/// Normalize a plugin-surface path: backslashes become forward slashes,
/// leading/trailing separators are dropped.
pub fn path_normalize(path: &str) -> String {
    let p: String = path.chars().map(|c| if c == '\\' { '/' } else { c }).collect();
    p.trim_matches('/').to_string()
}

/// Split off the first path segment. `"a/b/c"` becomes `("a", "b/c")`.
pub fn path_split_first(path: &str) -> (&str, &str) {
    match path.find('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => (path, ""),
    }
}

/// Decode a guest UTF-16LE buffer into a lossy string, stopping at the
/// first NUL character.
pub fn utf16_to_string(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    U16String::from_vec(units).to_string_lossy()
}

/// Lower-bound over a sorted slice: index of the first element for which
/// `key(elem) >= target`.
pub fn lower_bound<T, K: Ord>(items: &[T], target: K, key: impl Fn(&T) -> K) -> usize {
    items.partition_point(|e| key(e) < target)
}
