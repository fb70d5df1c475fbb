//! Plain-text identifier files: one identifier per line.

use std::io::{self, Write};

/// Splits an uploaded file into candidate identifiers, one per line.
///
/// Accepts `\n` and `\r\n` line endings. Lines are trimmed and blank lines
/// dropped.
pub fn parse_upload(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Writes `identifiers` separated by newlines, without a trailing newline.
///
/// # Errors
///
/// Propagates any error from `writer`.
pub fn write_identifiers<W: Write>(mut writer: W, identifiers: &[String]) -> io::Result<()> {
    for (i, id) in identifiers.iter().enumerate() {
        if i > 0 {
            writer.write_all(b"\n")?;
        }
        writer.write_all(id.as_bytes())?;
    }
    writer.flush()
}
