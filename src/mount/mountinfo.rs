// /proc/self/mountinfo parsing
//
// Line format (proc(5)):
//   36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
// Field 5 is the mount point, with space, tab, newline and backslash
// written as three-digit octal escapes. After the ` - ` separator come the
// filesystem type and the mount source.

use std::path::{Path, PathBuf};

const MOUNT_POINT_FIELD: usize = 4;
const SOURCE_FIELD: usize = 1;

/// Mount points listed in a mountinfo table, in table order.
pub fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(MOUNT_POINT_FIELD))
        .map(|field| PathBuf::from(unescape(field)))
}

pub fn contains(table: &str, path: &Path) -> bool {
    mount_points(table).any(|mount_point| mount_point == path)
}

/// Source of the mount at `path`. With stacked mounts the last (visible) one wins.
pub fn source_of(table: &str, path: &Path) -> Option<PathBuf> {
    table
        .lines()
        .filter_map(|line| {
            let mount_point = line.split_whitespace().nth(MOUNT_POINT_FIELD)?;
            if Path::new(&unescape(mount_point)) != path {
                return None;
            }
            let (_, tail) = line.split_once(" - ")?;
            tail.split_whitespace().nth(SOURCE_FIELD).map(|s| PathBuf::from(unescape(s)))
        })
        .last()
}

/// Decode the `\ooo` escapes the kernel writes into mountinfo fields.
pub fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3
        && (b'0'..=b'3').contains(&digits[0])
        && digits[1..].iter().all(|d| (b'0'..=b'7').contains(d))
}
