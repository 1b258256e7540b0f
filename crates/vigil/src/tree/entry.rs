// Copyright (c) 2025 Vigil and contributors

// SPDX-License-Identifier: MIT
// Third-party contributions licensed under DCO

// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:

// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NON-INFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

// ----------------------------------------------------------------------------

//! Directory entry.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::event::Kind;

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Directory entry.
///
/// A record of one filesystem object below a watched root. At least one of
/// the identity fields should be populated when known - identity comparison
/// prefers the file identifier, then the inode, then the path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Absolute path.
    pub path: PathBuf,
    /// Inode identifier, if known.
    pub ino: Option<u64>,
    /// Textual file identifier, if known.
    pub file_id: Option<String>,
    /// Modification time in nanoseconds since the epoch.
    pub mtime: u64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

// ----------------------------------------------------------------------------

/// Snapshot reader.
///
/// A byte-level cursor over serialized snapshot text. Paths are stored as a
/// length-prefixed run of raw bytes, so the reader cannot tokenize on
/// whitespace alone - it alternates between whitespace-delimited numeric
/// fields and exact byte runs.
pub(crate) struct Reader<'a> {
    /// Snapshot bytes.
    data: &'a [u8],
    /// Cursor position.
    pos: usize,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl DirEntry {
    /// Creates a directory entry.
    #[must_use]
    pub fn new(
        path: PathBuf,
        ino: Option<u64>,
        mtime: u64,
        is_dir: bool,
        file_id: Option<&str>,
    ) -> Self {
        Self {
            path,
            ino,
            file_id: file_id.map(String::from),
            mtime,
            is_dir,
        }
    }

    /// Returns the file kind of the entry.
    #[must_use]
    pub fn kind(&self) -> Kind {
        if self.is_dir {
            Kind::Directory
        } else {
            Kind::File
        }
    }

    /// Reads an entry from serialized snapshot text.
    ///
    /// Trailing identity fields may be missing on snapshots written by
    /// earlier versions, in which case they default to sentinels. Presence
    /// is detected by peeking past spaces for the end of the line.
    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let length = reader.number()? as usize;
        let path = decode(reader.take(length)?)?;
        let mtime = reader.number()?;
        let is_dir = reader.number()? != 0;

        let mut ino = None;
        if reader.has_more_fields() {
            ino = match reader.number()? {
                0 => None,
                value => Some(value),
            };
        }

        let mut file_id = None;
        if reader.has_more_fields() {
            file_id = match reader.token() {
                b"" | b"0" => None,
                token => Some(
                    std::str::from_utf8(token)
                        .map_err(|_| Error::Snapshot("invalid file id".into()))?
                        .to_string(),
                ),
            };
        }

        Ok(Self { path, ino, file_id, mtime, is_dir })
    }

    /// Writes the entry as serialized snapshot text.
    pub(crate) fn write(&self, writer: &mut impl Write) -> Result {
        let path = encode(&self.path)?;
        write!(writer, "{}", path.len())?;
        writer.write_all(path)?;
        write!(
            writer,
            "{} {} {} {} \n",
            self.mtime,
            u8::from(self.is_dir),
            self.ino.unwrap_or(0),
            self.file_id.as_deref().unwrap_or("0"),
        )?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------

impl<'a> Reader<'a> {
    /// Creates a snapshot reader over the given bytes.
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Checks whether any bytes remain.
    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Parses a decimal number, skipping leading whitespace.
    pub(crate) fn number(&mut self) -> Result<u64> {
        while self.peek().is_some_and(|byte| byte.is_ascii_whitespace()) {
            self.pos += 1;
        }

        let start = self.pos;
        while self.peek().is_some_and(|byte| byte.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(Error::Snapshot("expected number".into()));
        }

        // The digit run is ASCII, so the conversion cannot fail, but the
        // value may still overflow on a corrupted snapshot
        std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| Error::Snapshot("number out of range".into()))
    }

    /// Takes exactly the given number of bytes.
    fn take(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(length).filter(|end| *end <= self.data.len());
        let end = end.ok_or_else(|| Error::Snapshot("truncated path".into()))?;

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Takes a whitespace-delimited token, skipping leading whitespace.
    fn token(&mut self) -> &'a [u8] {
        while self.peek().is_some_and(|byte| byte.is_ascii_whitespace()) {
            self.pos += 1;
        }

        let start = self.pos;
        while self.peek().is_some_and(|byte| !byte.is_ascii_whitespace()) {
            self.pos += 1;
        }
        &self.data[start..self.pos]
    }

    /// Checks whether more fields exist before the end of the line.
    ///
    /// Skips spaces, but never the newline itself - the next field parser
    /// picks up right at the first non-space byte.
    fn has_more_fields(&mut self) -> bool {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
        !matches!(self.peek(), None | Some(b'\n') | Some(b'\r'))
    }

    /// Returns the next byte without consuming it.
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Decodes a path from raw snapshot bytes.
#[cfg(unix)]
fn decode(bytes: &[u8]) -> Result<PathBuf> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    Ok(PathBuf::from(OsStr::from_bytes(bytes)))
}

/// Decodes a path from raw snapshot bytes.
#[cfg(not(unix))]
fn decode(bytes: &[u8]) -> Result<PathBuf> {
    std::str::from_utf8(bytes)
        .map(PathBuf::from)
        .map_err(|_| Error::Snapshot("invalid path encoding".into()))
}

/// Encodes a path as raw snapshot bytes.
#[cfg(unix)]
fn encode(path: &Path) -> Result<&[u8]> {
    use std::os::unix::ffi::OsStrExt;

    Ok(path.as_os_str().as_bytes())
}

/// Encodes a path as raw snapshot bytes.
#[cfg(not(unix))]
fn encode(path: &Path) -> Result<&[u8]> {
    path.to_str()
        .map(str::as_bytes)
        .ok_or_else(|| Error::Snapshot("invalid path encoding".into()))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(entry: &DirEntry) -> DirEntry {
        let mut buffer = Vec::new();
        entry.write(&mut buffer).unwrap();
        DirEntry::read(&mut Reader::new(&buffer)).unwrap()
    }

    #[test]
    fn entry_roundtrip() {
        let entry = DirEntry::new(
            PathBuf::from("/root/sub/doc.txt"),
            Some(42),
            1_234_567_890,
            false,
            Some("7-42"),
        );
        assert_eq!(roundtrip(&entry), entry);
    }

    #[test]
    fn entry_roundtrip_with_sentinels() {
        let entry = DirEntry::new(PathBuf::from("/root/sub"), None, 99, true, None);
        assert_eq!(roundtrip(&entry), entry);
    }

    #[test]
    fn entry_reads_legacy_line_without_identity() {
        // Lines written before identity fields existed stop after the kind
        let line = b"9/root/doc1000 0\n";
        let entry = DirEntry::read(&mut Reader::new(line)).unwrap();
        assert_eq!(entry.path, PathBuf::from("/root/doc"));
        assert_eq!(entry.mtime, 1000);
        assert_eq!(entry.ino, None);
        assert_eq!(entry.file_id, None);
    }

    #[test]
    fn entry_reads_line_with_ino_only() {
        let line = b"9/root/doc1000 0 77 \n";
        let entry = DirEntry::read(&mut Reader::new(line)).unwrap();
        assert_eq!(entry.ino, Some(77));
        assert_eq!(entry.file_id, None);
    }

    #[test]
    fn entry_rejects_truncated_path() {
        let line = b"99/root";
        assert!(DirEntry::read(&mut Reader::new(line)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn entry_preserves_non_utf8_path() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = PathBuf::from(OsStr::from_bytes(b"/root/\xff\xfe"));
        let entry = DirEntry::new(path, Some(1), 1, false, None);
        assert_eq!(roundtrip(&entry), entry);
    }
}
