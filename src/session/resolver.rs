//! Project path resolver — decodes the engine's encoded directory names and
//! locates session transcripts.
//!
//! The engine stores one transcript directory per working directory under a
//! shared projects root, naming it by the absolute path with every `/`
//! replaced by `-`. A `-` that was already in the path is indistinguishable
//! from an encoded `/`, so decoding reconstructs segments greedily left to
//! right: a boundary is committed as a separator only when the directory
//! built so far exists on disk, otherwise the hyphen stays literal.

use std::path::{Path, PathBuf};

/// File extension of engine transcript files.
const TRANSCRIPT_EXT: &str = "jsonl";

/// Resolves encoded project directories and transcript locations.
#[derive(Debug, Clone)]
pub struct ProjectResolver {
    projects_root: PathBuf,
}

impl ProjectResolver {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
        }
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// Encode a working directory the way the engine names its transcript
    /// directory.
    pub fn encode_project_dir(path: &Path) -> String {
        path.display().to_string().replace('/', "-")
    }

    /// Reconstruct the original absolute path from an encoded directory name.
    ///
    /// Linear in the number of hyphen tokens: one directory-existence check
    /// per boundary, rather than enumerating every split combination. The
    /// final segment is committed unconditionally, so a path whose last
    /// component no longer exists is still returned — callers must tolerate
    /// a best-effort result.
    pub fn decode_project_dir(&self, encoded: &str) -> PathBuf {
        let trimmed = encoded.strip_prefix('-').unwrap_or(encoded);
        let mut path = PathBuf::from("/");
        if trimmed.is_empty() {
            return path;
        }

        let tokens: Vec<&str> = trimmed.split('-').collect();
        let mut segment = String::new();
        for (i, token) in tokens.iter().enumerate() {
            if !segment.is_empty() {
                segment.push('-');
            }
            segment.push_str(token);

            let last = i + 1 == tokens.len();
            if last || path.join(&segment).is_dir() {
                path.push(&segment);
                segment.clear();
            }
        }
        path
    }

    /// Locate the transcript file for a session id by scanning all project
    /// directories under the root. Returns the first match; under correct
    /// encoding a session id only ever exists in one directory.
    pub fn find_transcript(&self, session_id: &str) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.projects_root).ok()?;
        let file_name = format!("{session_id}.{TRANSCRIPT_EXT}");
        for entry in entries.flatten() {
            let candidate = entry.path().join(&file_name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}
