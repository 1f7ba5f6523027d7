//! USTAR/GNU 512-byte header codec.
//!
//! # Background
//!
//! Every TAR member starts with one 512-byte header block.  USTAR (POSIX
//! 1003.1-1988) fixes the field layout below; the GNU dialect extends the
//! size field for files of 8 GiB and more.  Generic archivers escape long
//! paths and huge sizes by emitting extra `LongLink`/PAX blocks in front of
//! the real header, which makes the byte position of every later member
//! depend on the metadata of every earlier one.
//!
//! # Why we build headers by hand
//!
//! Tape offsets are computed before a single byte is streamed, so the layout
//! must be a pure function of the inventory: one logical entry, exactly one
//! 512-byte header, no extension blocks ever.  A header that cannot be
//! expressed inside those 512 bytes is rejected up front instead of silently
//! growing the stream.
//!
//! # Field map
//!
//! | Offset | Width | Field    | Encoding                          |
//! |--------|-------|----------|-----------------------------------|
//! |   0    |  100  | name     | UTF-8, NUL-padded                 |
//! |  100   |   8   | mode     | octal, leading zeros, NUL         |
//! |  108   |   8   | uid      | octal                             |
//! |  116   |   8   | gid      | octal                             |
//! |  124   |  12   | size     | octal, or GNU base-256 for >= 8 GiB |
//! |  136   |  12   | mtime    | octal                             |
//! |  148   |   8   | checksum | 6 octal digits + NUL + space      |
//! |  156   |   1   | typeflag | `'0'` file, `'5'` dir, `'2'` symlink |
//! |  157   |  100  | linkname | UTF-8, NUL-padded                 |
//! |  257   |   6   | magic    | `"ustar\0"`                       |
//! |  263   |   2   | version  | `"00"`                            |
//! |  265   |  32   | uname    | UTF-8, NUL-padded                 |
//! |  297   |  32   | gname    | UTF-8, NUL-padded                 |
//! |  345   |  155  | prefix   | UTF-8, NUL-padded                 |
//!
//! # References
//!
//! - POSIX ustar layout: <https://pubs.opengroup.org/onlinepubs/9699919799/utilities/pax.html#tag_20_92_13_06>
//! - GNU extensions: <https://www.gnu.org/software/tar/manual/html_node/Standard.html>

use crate::error::TapeError;
use crate::track::Track;

/// Header blocks are exactly this long, always.
pub const HEADER_SIZE: usize = 512;

const NAME_LIMIT: usize = 100;
const PREFIX_LIMIT: usize = 155;
const LINKNAME_LIMIT: usize = 100;
const OWNER_NAME_LIMIT: usize = 32;
const PATH_LIMIT: usize = 255;

/// Largest size an 11-digit octal field can carry: 2^33 - 1 (8 GiB - 1).
const OCTAL_SIZE_LIMIT: u64 = 0o77777777777;

/// Render the 512-byte header for one track.
///
/// Fails with [`TapeError::Compliance`] when the track cannot be expressed
/// in a single USTAR block (path unsplittable, over-long component, link
/// target or owner name, or a numeric field that overflows its octal width).
pub fn build(track: &Track) -> Result<[u8; HEADER_SIZE], TapeError> {
    validate_compliance(track)?;

    let mut buf = [0u8; HEADER_SIZE];
    let arc_path = &track.arc_path;

    // Split the bare path first; the directory marker is appended to the
    // name side afterwards so the split never sees the trailing slash.
    let bare = arc_path.trim_end_matches('/');
    let (name, prefix) = split_path(arc_path, bare)?;
    let mut name = name.to_owned();
    if track.is_dir {
        name.push('/');
        if name.len() > NAME_LIMIT {
            return Err(TapeError::Compliance {
                path: arc_path.clone(),
                reason: format!(
                    "directory name '{name}' exceeds {NAME_LIMIT} bytes once the trailing slash is added"
                ),
            });
        }
    }

    set_string(&mut buf, arc_path, 0, NAME_LIMIT, &name)?;
    set_string(&mut buf, arc_path, 345, PREFIX_LIMIT, prefix)?;

    set_octal(&mut buf, arc_path, 100, 8, track.mode as u64)?;
    set_octal(&mut buf, arc_path, 108, 8, track.uid as u64)?;
    set_octal(&mut buf, arc_path, 116, 8, track.gid as u64)?;
    set_size(&mut buf, arc_path, track.content_size())?;
    set_octal(&mut buf, arc_path, 136, 12, track.mtime)?;

    let typeflag = if track.is_dir {
        b'5'
    } else if track.is_symlink {
        set_string(&mut buf, arc_path, 157, LINKNAME_LIMIT, &track.linkname)?;
        b'2'
    } else {
        b'0'
    };
    buf[156] = typeflag;

    // The magic + version pair is what makes readers honour the prefix field.
    buf[257..263].copy_from_slice(b"ustar\0");
    buf[263..265].copy_from_slice(b"00");

    set_string(&mut buf, arc_path, 265, OWNER_NAME_LIMIT, &track.uname)?;
    set_string(&mut buf, arc_path, 297, OWNER_NAME_LIMIT, &track.gname)?;

    write_checksum(&mut buf);
    Ok(buf)
}

/// Check every fixed-width limit for a track in one pass.
///
/// Reports all violations together so a caller at record time sees the full
/// diagnosis instead of the first failure.
pub fn validate_compliance(track: &Track) -> Result<(), TapeError> {
    let mut reasons: Vec<String> = Vec::new();

    if track.uname.len() > OWNER_NAME_LIMIT {
        reasons.push(format!(
            "user name '{}' exceeds {OWNER_NAME_LIMIT} bytes (has {})",
            track.uname,
            track.uname.len()
        ));
    }
    if track.gname.len() > OWNER_NAME_LIMIT {
        reasons.push(format!(
            "group name '{}' exceeds {OWNER_NAME_LIMIT} bytes (has {})",
            track.gname,
            track.gname.len()
        ));
    }
    if track.is_symlink && track.linkname.len() > LINKNAME_LIMIT {
        reasons.push(format!(
            "symlink target exceeds {LINKNAME_LIMIT} bytes (has {})",
            track.linkname.len()
        ));
    }
    if track.arc_path.len() > PATH_LIMIT {
        reasons.push(format!(
            "path exceeds {PATH_LIMIT} bytes (has {})",
            track.arc_path.len()
        ));
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(TapeError::Compliance {
            path: track.arc_path.clone(),
            reason: reasons.join(" | "),
        })
    }
}

/// Split a path into USTAR `(name, prefix)` halves, both measured in UTF-8
/// bytes.
///
/// Paths of up to 100 bytes need no prefix.  Longer ones are split at the
/// right-most `/` that leaves the prefix within 155 bytes and the name
/// within 100; a path with no such separator cannot be represented.
fn split_path<'a>(arc_path: &str, bare: &'a str) -> Result<(&'a str, &'a str), TapeError> {
    if bare.len() <= NAME_LIMIT {
        return Ok((bare, ""));
    }

    if let Some(component) = bare.split('/').find(|c| c.len() > NAME_LIMIT) {
        return Err(TapeError::Compliance {
            path: arc_path.to_owned(),
            reason: format!(
                "path component '{}' exceeds {NAME_LIMIT} bytes (has {})",
                component,
                component.len()
            ),
        });
    }

    // '/' is a single byte in UTF-8, so byte positions of separators are
    // always valid char boundaries.
    let mut best: Option<usize> = None;
    for (i, byte) in bare.bytes().enumerate() {
        if byte == b'/' && i <= PREFIX_LIMIT && bare.len() - i - 1 <= NAME_LIMIT {
            best = Some(i);
        }
    }

    match best {
        Some(i) => Ok((&bare[i + 1..], &bare[..i])),
        None => Err(TapeError::Compliance {
            path: arc_path.to_owned(),
            reason: "path cannot be split into USTAR prefix/name".to_owned(),
        }),
    }
}

/// Write a NUL-padded UTF-8 string field.
fn set_string(
    buf: &mut [u8; HEADER_SIZE],
    arc_path: &str,
    offset: usize,
    width: usize,
    value: &str,
) -> Result<(), TapeError> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(TapeError::Compliance {
            path: arc_path.to_owned(),
            reason: format!(
                "'{value}' does not fit the {width}-byte field at offset {offset} (has {})",
                bytes.len()
            ),
        });
    }
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Write a zero-padded octal field with its trailing NUL.
fn set_octal(
    buf: &mut [u8; HEADER_SIZE],
    arc_path: &str,
    offset: usize,
    width: usize,
    value: u64,
) -> Result<(), TapeError> {
    let digits = format!("{value:o}");
    let max_digits = width - 1;
    if digits.len() > max_digits {
        return Err(TapeError::Compliance {
            path: arc_path.to_owned(),
            reason: format!("value {value} does not fit a {width}-byte octal field"),
        });
    }

    let field = &mut buf[offset..offset + width];
    field[..max_digits - digits.len()].fill(b'0');
    field[max_digits - digits.len()..max_digits].copy_from_slice(digits.as_bytes());
    field[max_digits] = 0;
    Ok(())
}

/// Write the size field: plain octal below 8 GiB, GNU base-256 above.
///
/// The base-256 form sets bit 0x80 in the first byte of the field and stores
/// the size as a big-endian unsigned integer in the remaining 11 bytes.  The
/// header stays 512 bytes either way; no extension block is ever emitted.
fn set_size(buf: &mut [u8; HEADER_SIZE], arc_path: &str, size: u64) -> Result<(), TapeError> {
    const OFFSET: usize = 124;

    if size <= OCTAL_SIZE_LIMIT {
        return set_octal(buf, arc_path, OFFSET, 12, size);
    }

    buf[OFFSET] = 0x80;
    // 11 bytes available, the value needs at most 8; left-pad with zeros.
    buf[OFFSET + 1..OFFSET + 4].fill(0);
    buf[OFFSET + 4..OFFSET + 12].copy_from_slice(&size.to_be_bytes());
    Ok(())
}

/// Compute and store the header checksum.
///
/// Per the standard the checksum field is summed as eight ASCII spaces, the
/// 512 bytes are added up as unsigned octets, and the result is stored as
/// six zero-padded octal digits followed by NUL and a space.
fn write_checksum(buf: &mut [u8; HEADER_SIZE]) {
    buf[148..156].fill(b' ');
    let sum: u32 = buf.iter().map(|&b| b as u32).sum();
    let field = format!("{sum:06o}\0 ");
    buf[148..156].copy_from_slice(field.as_bytes());
}
