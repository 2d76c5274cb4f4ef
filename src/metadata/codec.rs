//! Trailer lines carrying dump options and provenance metadata.
//!
//! A dump artifact ends with exactly two lines:
//!
//! ```text
//! -- options:{"includeData":true,...}
//! -- meta:{"default":{"connection":"mysql",...},...}
//! ```
//!
//! Both are SQL comments, so the dump stays loadable by the native client.

use regex::Regex;
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

use crate::errors::Result;

pub const OPTIONS_KEY: &str = "options";
pub const META_KEY: &str = "meta";
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
const TRAILER_LINES: usize = 2;

fn trailer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^-- ([a-z]+):(.*)$").expect("static trailer pattern"))
}

/// Which generation of the meta layout a dump was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataShape {
    /// Flat object with `connection`, `database` and `dumpedAtDate` at the top level.
    Legacy,
    /// One nested block per provider, the built-in one under `default`.
    ProviderKeyed,
    /// A mapping that carries neither marker.
    Unknown,
}

/// Decoded trailer of a recognised dump.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpMetadata {
    pub options: Map<String, Value>,
    pub meta: Map<String, Value>,
    pub shape: MetadataShape,
}

impl DumpMetadata {
    pub fn new(options: Map<String, Value>, meta: Map<String, Value>) -> Self {
        let shape = if meta.get("default").is_some_and(Value::is_object) {
            MetadataShape::ProviderKeyed
        } else if meta.contains_key("dumpedAtDate") {
            MetadataShape::Legacy
        } else {
            MetadataShape::Unknown
        };
        DumpMetadata {
            options,
            meta,
            shape,
        }
    }

    fn field(&self, name: &str) -> Option<&Value> {
        match self.shape {
            MetadataShape::ProviderKeyed => self.meta.get("default")?.get(name),
            MetadataShape::Legacy => self.meta.get(name),
            MetadataShape::Unknown => None,
        }
    }

    /// Name of the connection the dump was taken from.
    pub fn connection(&self) -> Option<&str> {
        self.field("connection").and_then(Value::as_str)
    }

    pub fn database(&self) -> Option<&str> {
        self.field("database").and_then(Value::as_str)
    }

    pub fn dumped_at(&self) -> Option<&str> {
        self.field("dumpedAtDate").and_then(Value::as_str)
    }
}

/// Reads and writes the trailer of dump artifacts.
#[derive(Debug, Clone, Copy)]
pub struct MetadataCodec {
    buffer_size: usize,
}

impl Default for MetadataCodec {
    fn default() -> Self {
        MetadataCodec::new(DEFAULT_BUFFER_SIZE)
    }
}

impl MetadataCodec {
    pub fn new(buffer_size: usize) -> Self {
        MetadataCodec {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Both trailer lines, each terminated by `\n`.
    pub fn encode(options: &Value, meta: &Value) -> Result<String> {
        Ok(format!(
            "-- {}:{}\n-- {}:{}\n",
            OPTIONS_KEY,
            serde_json::to_string(options)?,
            META_KEY,
            serde_json::to_string(meta)?
        ))
    }

    /// Appends the trailer to a finished dump.
    pub fn append(path: &Path, options: &Value, meta: &Value) -> Result<()> {
        let trailer = Self::encode(options, meta)?;
        let mut file = OpenOptions::new().read(true).append(true).open(path)?;

        let len = file.metadata()?.len();
        let mut needs_newline = false;
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))?;
            file.read_exact(&mut last)?;
            needs_newline = last[0] != b'\n';
        }
        if needs_newline {
            file.write_all(b"\n")?;
        }
        file.write_all(trailer.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Decodes the trailer of `path`.
    ///
    /// `None` means "not a recognised dump": the file is missing, too short,
    /// or its last two lines are not a well-formed trailer.
    pub fn decode(&self, path: &Path) -> Option<DumpMetadata> {
        let lines = match self.tail_lines(path, TRAILER_LINES) {
            Ok(Some(lines)) => lines,
            Ok(None) => return None,
            Err(e) => {
                debug!("Could not read trailer of {}: {}", path.display(), e);
                return None;
            }
        };

        let mut options = None;
        let mut meta = None;
        for line in &lines {
            let captures = trailer_pattern().captures(line)?;
            let payload = match serde_json::from_str::<Value>(&captures[2]) {
                Ok(Value::Object(map)) => map,
                _ => return None,
            };
            match &captures[1] {
                OPTIONS_KEY => options = Some(payload),
                META_KEY => meta = Some(payload),
                _ => return None,
            }
        }

        Some(DumpMetadata::new(options?, meta?))
    }

    /// The last `count` lines of `path`, read backwards in `buffer_size`
    /// chunks. A single trailing newline does not start a new line.
    ///
    /// Lines are split on raw `\n` bytes before any UTF-8 decoding, so a
    /// multi-byte character straddling a chunk boundary is reassembled intact.
    fn tail_lines(&self, path: &Path, count: usize) -> io::Result<Option<Vec<String>>> {
        let mut file = File::open(path)?;
        let mut pos = file.metadata()?.len();
        let mut tail: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; self.buffer_size];

        while pos > 0 {
            let read_size = self.buffer_size.min(pos as usize);
            pos -= read_size as u64;
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut chunk[..read_size])?;

            let mut joined = Vec::with_capacity(read_size + tail.len());
            joined.extend_from_slice(&chunk[..read_size]);
            joined.extend_from_slice(&tail);
            tail = joined;

            // Enough once a newline precedes the earliest wanted line.
            if complete_line_breaks(&tail) >= count {
                break;
            }
        }

        let body = tail.strip_suffix(b"\n").unwrap_or(&tail);
        if body.is_empty() {
            return Ok(None);
        }
        let lines: Vec<&[u8]> = body.split(|b| *b == b'\n').collect();
        if lines.len() < count {
            return Ok(None);
        }

        let mut result = Vec::with_capacity(count);
        for line in &lines[lines.len() - count..] {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            match String::from_utf8(line.to_vec()) {
                Ok(s) => result.push(s),
                Err(_) => return Ok(None),
            }
        }
        Ok(Some(result))
    }
}

fn complete_line_breaks(tail: &[u8]) -> usize {
    let body = tail.strip_suffix(b"\n").unwrap_or(tail);
    body.iter().filter(|b| **b == b'\n').count()
}
