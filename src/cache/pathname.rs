//! Pathname codec for cached objects.
//!
//! Every object lives at `<base>/<type>/<shard>/<id-hex>[.<ext>]`. The
//! shard keeps any single directory small; it is the first two characters
//! of the object ID's hex form, zero-extended on the left so single-digit
//! IDs still produce a two-character segment. The extension of the original
//! filename is carried over so downstream tools can sniff content types.
//!
//! Encoding and decoding are pure functions of the ID, the type name and
//! the base directory; decoding a pathname the codec produced always
//! yields the original ID.

use std::path::{Path, PathBuf};

use super::{CacheError, ObjectId, Result};

/// Width of the shard directory name in hex characters.
const SHARD_WIDTH: usize = 2;

/// The shard directory name for an object ID.
pub fn shard_for(id: ObjectId) -> String {
    let hex = format!("{:x}", id);
    if hex.len() >= SHARD_WIDTH {
        hex[..SHARD_WIDTH].to_string()
    } else {
        format!("{:0>width$}", hex, width = SHARD_WIDTH)
    }
}

/// Extension of an original filename, including the leading dot.
///
/// Returns an empty string when the name has no usable extension.
fn extension_of(file_name: &str) -> String {
    match Path::new(file_name).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => format!(".{}", ext),
        _ => String::new(),
    }
}

/// Build the on-disk pathname for an object.
pub fn build_pathname(base: &Path, type_name: &str, id: ObjectId, file_name: &str) -> PathBuf {
    let leaf = format!("{:x}{}", id, extension_of(file_name));
    base.join(type_name).join(shard_for(id)).join(leaf)
}

/// Parse the object ID out of a pathname.
///
/// Fails with `Exists` when the leaf is not a valid non-zero hex ID; the
/// caller treats that the same as an object that is no longer cached.
pub fn object_id_from_path(path: &Path) -> Result<ObjectId> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| invalid_id(path))?;
    let id = ObjectId::from_str_radix(stem, 16).map_err(|_| invalid_id(path))?;
    if id == 0 {
        return Err(invalid_id(path));
    }
    Ok(id)
}

/// Extract the type-name segment from a pathname under `base`.
///
/// Returns an empty string when the path is not of the expected
/// `<base>/<type>/<shard>/<leaf>` shape.
pub fn type_name_from_path(base: &Path, path: &Path) -> String {
    let Ok(rel) = path.strip_prefix(base) else {
        return String::new();
    };
    let mut parts = rel.components().filter_map(|c| match c {
        std::path::Component::Normal(s) => s.to_str(),
        _ => None,
    });
    let (type_name, shard, leaf) = (parts.next(), parts.next(), parts.next());
    match (type_name, shard, leaf, parts.next()) {
        (Some(type_name), Some(shard), Some(_), None) if shard.len() == SHARD_WIDTH => {
            type_name.to_string()
        }
        _ => String::new(),
    }
}

/// Decode a pathname into its object ID and type name.
///
/// Validates that the path lies under `base`, carries a well-formed hex ID
/// and sits in the shard directory the ID encodes to.
pub fn decode_pathname(base: &Path, path: &Path) -> Result<(ObjectId, String)> {
    let type_name = type_name_from_path(base, path);
    if type_name.is_empty() {
        return Err(CacheError::Exists(format!(
            "'{}' is not a cache pathname",
            path.display()
        )));
    }
    let id = object_id_from_path(path)?;
    let shard = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .unwrap_or("");
    if shard != shard_for(id) {
        return Err(invalid_id(path));
    }
    Ok((id, type_name))
}

fn invalid_id(path: &Path) -> CacheError {
    CacheError::Exists(format!(
        "invalid object id derived from pathname '{}'",
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_preserves_extension() {
        let base = Path::new("/var/filecache");
        let p = build_pathname(base, "photos", 0x1a2b, "beach.jpg");
        assert_eq!(p, Path::new("/var/filecache/photos/1a/1a2b.jpg"));
    }

    #[test]
    fn test_build_without_extension() {
        let base = Path::new("/var/filecache");
        let p = build_pathname(base, "blobs", 7, "README");
        assert_eq!(p, Path::new("/var/filecache/blobs/07/7"));
    }

    #[test]
    fn test_round_trip() {
        let base = Path::new("/cache");
        for id in [1u64, 0xf, 0x10, 0xabc, 0xdead_beef, u64::MAX] {
            let p = build_pathname(base, "t", id, "file.tar.gz");
            let (decoded, type_name) = decode_pathname(base, &p).unwrap();
            assert_eq!(decoded, id);
            assert_eq!(type_name, "t");
        }
    }

    #[test]
    fn test_decode_rejects_foreign_paths() {
        let base = Path::new("/cache");
        assert!(decode_pathname(base, Path::new("/etc/passwd")).is_err());
        assert!(decode_pathname(base, Path::new("/cache/t/zz/nothex.jpg")).is_err());
        assert!(decode_pathname(base, Path::new("/cache/t/00/0")).is_err());
        // Wrong shard for the encoded id.
        assert!(decode_pathname(base, Path::new("/cache/t/ff/1a2b.jpg")).is_err());
        // Missing shard level.
        assert!(decode_pathname(base, Path::new("/cache/t/1a2b.jpg")).is_err());
    }

    #[test]
    fn test_type_name_extraction() {
        let base = Path::new("/cache");
        let p = build_pathname(base, "mail", 0x42, "msg.eml");
        assert_eq!(type_name_from_path(base, &p), "mail");
        assert_eq!(type_name_from_path(base, Path::new("/other/mail/04/42")), "");
        assert_eq!(type_name_from_path(base, Path::new("/cache/mail")), "");
    }

    #[test]
    fn test_shard_is_stable_prefix() {
        assert_eq!(shard_for(0x5), "05");
        assert_eq!(shard_for(0x1a2b), "1a");
        assert_eq!(shard_for(0xff), "ff");
    }
}
