//! Picks "the" dump file out of a directory of candidates.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::metadata::DumpMetadata;

/// A file found under the base directory, with whatever trailer it carried.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub metadata: Option<DumpMetadata>,
}

impl CandidateFile {
    /// Connection recorded in the trailer, if the file is a recognised dump.
    pub fn connection(&self) -> Option<&str> {
        self.metadata.as_ref()?.connection()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Outcome of a selection.
#[derive(Debug, Clone)]
pub enum Selection {
    /// Exactly one eligible file; safe to use without asking.
    Single(CandidateFile),
    /// Several eligible files, newest first. The caller must pick one.
    Choose(Vec<CandidateFile>),
    /// Nothing eligible.
    Empty,
}

/// Candidates keyed by originating connection. Files without usable
/// metadata share the `None` bucket.
pub type ConnectionBuckets = BTreeMap<Option<String>, Vec<CandidateFile>>;

#[derive(Debug, Clone)]
pub struct FileSelectionResolver {
    connection: String,
    ignore_connection_filter: bool,
}

impl FileSelectionResolver {
    pub fn new(connection: impl Into<String>) -> Self {
        FileSelectionResolver {
            connection: connection.into(),
            ignore_connection_filter: false,
        }
    }

    pub fn ignore_connection_filter(mut self, ignore: bool) -> Self {
        self.ignore_connection_filter = ignore;
        self
    }

    pub fn group(candidates: Vec<CandidateFile>) -> ConnectionBuckets {
        let mut buckets = ConnectionBuckets::new();
        for candidate in candidates {
            let key = candidate.connection().map(str::to_string);
            buckets.entry(key).or_default().push(candidate);
        }
        for files in buckets.values_mut() {
            sort_newest_first(files);
        }
        buckets
    }

    /// Offers the files that belong to the target connection. Other
    /// connections and metadata-less files only take part when the
    /// connection filter is ignored.
    pub fn resolve(&self, candidates: Vec<CandidateFile>) -> Selection {
        let mut offered = if self.ignore_connection_filter {
            candidates
        } else {
            Self::group(candidates)
                .remove(&Some(self.connection.clone()))
                .unwrap_or_default()
        };
        sort_newest_first(&mut offered);

        match offered.len() {
            0 => Selection::Empty,
            1 => Selection::Single(offered.remove(0)),
            _ => Selection::Choose(offered),
        }
    }
}

// Ties on mtime fall back to the path so the order is stable.
fn sort_newest_first(files: &mut [CandidateFile]) {
    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
}
