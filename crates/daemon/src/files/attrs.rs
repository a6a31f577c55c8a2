//! Conversion of filesystem metadata into protocol attributes and long names.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use chrono::{DateTime, Utc};
use protocol::messages::{FileAttributes, S_IFDIR, S_IFLNK, S_IFMT};

/// Build protocol attributes from filesystem metadata.
pub fn attributes_from_metadata(metadata: &Metadata) -> FileAttributes {
    FileAttributes {
        size: metadata.size(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        permissions: metadata.mode(),
        atime: metadata.atime().max(0) as u64,
        mtime: metadata.mtime().max(0) as u64,
    }
}

/// `ls -l` style line for a listing entry.
///
/// `owner` is the display identity configured for the share; it fills both
/// the user and group columns.
pub fn long_name(name: &str, attrs: &FileAttributes, owner: &str) -> String {
    format!(
        "{} 1 {:<8} {:<8} {:>8} {} {}",
        mode_string(attrs.permissions),
        owner,
        owner,
        attrs.size,
        format_mtime(attrs.mtime),
        name
    )
}

/// Render a Unix mode as the ten-character `drwxr-xr-x` form.
pub fn mode_string(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        _ => '-',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn format_mtime(mtime: u64) -> String {
    i64::try_from(mtime)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_default()
        .format("%b %d %H:%M")
        .to_string()
}
