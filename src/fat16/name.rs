//! 8.3 short name coding.
//!
//! Names are upper-cased ASCII, split at the first dot, space-padded to
//! 8 + 3 bytes. Long file name entries are not produced and are skipped
//! on scans.

use alloc::string::String;

use super::{Fat16Error, Result};

/// The encoded `.` entry every subdirectory starts with.
pub(super) const DOT_NAME: [u8; 11] = *b".          ";
/// The encoded `..` entry pointing at the parent.
pub(super) const DOTDOT_NAME: [u8; 11] = *b"..         ";

/// Encode a user-facing name into the padded 11-byte on-disk form.
///
/// Oversized name or extension parts are truncated, matching the lax
/// behavior of DOS-era tools. Empty names and dot-relative names are
/// rejected; path resolution strips `.`/`..` long before this point.
pub(super) fn encode_83(input: &str) -> Result<[u8; 11]> {
    if input.is_empty() || input.starts_with('.') || !input.is_ascii() {
        return Err(Fat16Error::InvalidName);
    }

    let mut out = [b' '; 11];

    let (name, ext) = match input.split_once('.') {
        Some((name, ext)) => (name, ext),
        None => (input, ""),
    };

    for (slot, byte) in out[..8].iter_mut().zip(name.bytes()) {
        *slot = byte.to_ascii_uppercase();
    }
    for (slot, byte) in out[8..].iter_mut().zip(ext.bytes()) {
        *slot = byte.to_ascii_uppercase();
    }

    Ok(out)
}

/// Decode the padded on-disk form back into `NAME.EXT`.
pub(super) fn decode_83(name11: &[u8; 11]) -> String {
    let mut out = String::new();

    for &byte in &name11[..8] {
        if byte == b' ' {
            break;
        }
        out.push(char::from(byte));
    }

    if name11[8] != b' ' {
        out.push('.');
        for &byte in &name11[8..] {
            if byte == b' ' {
                break;
            }
            out.push(char::from(byte));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_encode_pads_name_and_extension() {
        assert_eq!(
            encode_83("init.elf").expect("valid name"),
            *b"INIT    ELF",
            "Name and extension are padded and upper-cased.",
        );
        assert_eq!(
            encode_83("A").expect("valid name"),
            *b"A          ",
            "Extensionless names leave the extension blank.",
        );
    }

    #[test_case]
    fn test_encode_decode_roundtrip() {
        for name in ["A.TXT", "README.MD", "KERNEL8", "X.C", "LONGNAME.BIN"] {
            let encoded = encode_83(name).expect("valid name");
            assert_eq!(decode_83(&encoded), name, "Round-trip must be identity.");
        }
    }

    #[test_case]
    fn test_lowercase_folds_to_uppercase() {
        let encoded = encode_83("hello.txt").expect("valid name");
        assert_eq!(decode_83(&encoded), "HELLO.TXT", "Lowercase input folds up.");
    }

    #[test_case]
    fn test_invalid_names_are_rejected() {
        assert!(encode_83("").is_err(), "Empty names are invalid.");
        assert!(encode_83(".hidden").is_err(), "Dot-names are invalid.");
    }
}
