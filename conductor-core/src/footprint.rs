//! File footprint resolution
//!
//! A footprint is the set of repository-relative paths a work item expects
//! to touch. Resolution is pluggable; the analyzer only sees the resulting
//! sets.

use regex::Regex;
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::work_item::WorkItem;
use crate::{Error, Result};

/// Produces the footprint of a work item, possibly empty
pub trait FootprintResolver: Send + Sync {
    fn resolve(&self, item: &WorkItem) -> Result<BTreeSet<String>>;
}

/// Normalize a path so textual variants of the same file compare equal
pub fn normalize_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Uses exactly the footprint declared on the work item
#[derive(Debug, Default, Clone)]
pub struct DeclaredFootprint;

impl FootprintResolver for DeclaredFootprint {
    fn resolve(&self, item: &WorkItem) -> Result<BTreeSet<String>> {
        Ok(item
            .declared_footprint
            .iter()
            .map(|p| normalize_path(p))
            .filter(|p| !p.is_empty())
            .collect())
    }
}

/// Declared footprint plus paths mentioned in the item's specification document
///
/// Paths are picked up from backtick-quoted tokens that look like files and
/// from list entries under a `Files` or `Footprint` heading. An item whose
/// document cannot be read fails resolution.
#[derive(Debug, Clone)]
pub struct SpecDocumentFootprint {
    base_dir: Option<PathBuf>,
    quoted: Regex,
    heading: Regex,
    list_entry: Regex,
}

impl SpecDocumentFootprint {
    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::Internal(format!("Invalid pattern: {}", e)))
        };
        Ok(Self {
            base_dir,
            quoted: compile(r"`([A-Za-z0-9_.\-/\\]+)`")?,
            heading: compile(r"(?i)^#{1,6}\s*(files|footprint)\b")?,
            list_entry: compile(r"^\s*[-*]\s+`?([A-Za-z0-9_.\-/\\]+)`?\s*$")?,
        })
    }

    fn looks_like_path(token: &str) -> bool {
        let has_extension = token
            .rsplit('/')
            .next()
            .map_or(false, |name| name.contains('.') && !name.ends_with('.'));
        (token.contains('/') || has_extension) && !token.starts_with('.') || token.starts_with("./")
    }

    /// Extract candidate paths from document text
    pub fn extract_paths(&self, text: &str) -> BTreeSet<String> {
        let mut paths = BTreeSet::new();
        let mut in_section = false;

        for line in text.lines() {
            if line.trim_start().starts_with('#') {
                in_section = self.heading.is_match(line.trim_start());
                continue;
            }
            if in_section {
                if let Some(caps) = self.list_entry.captures(line) {
                    paths.insert(normalize_path(&caps[1]));
                    continue;
                }
            }
            for caps in self.quoted.captures_iter(line) {
                let token = &caps[1];
                if Self::looks_like_path(token) {
                    paths.insert(normalize_path(token));
                }
            }
        }

        paths.retain(|p| !p.is_empty());
        paths
    }
}

impl FootprintResolver for SpecDocumentFootprint {
    fn resolve(&self, item: &WorkItem) -> Result<BTreeSet<String>> {
        let mut paths = DeclaredFootprint.resolve(item)?;
        let Some(spec_path) = &item.spec_path else {
            return Ok(paths);
        };

        let full_path = match &self.base_dir {
            Some(base) if spec_path.is_relative() => base.join(spec_path),
            _ => spec_path.clone(),
        };
        let text = std::fs::read_to_string(&full_path).map_err(|e| {
            Error::footprint_unavailable(
                &item.id,
                format!("cannot read {}: {}", full_path.display(), e),
            )
        })?;

        paths.extend(self.extract_paths(&text));
        Ok(paths)
    }
}
