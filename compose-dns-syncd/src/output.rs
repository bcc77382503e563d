use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use shared::types::Pair;
use crate::error::OutputError;
use crate::fsutil::write_atomic;
use crate::reconcile::EditSet;

/// A candidate pair rejected because another line already maps its name elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub rejected: Pair,
    pub existing: String,
}

/// What applying an edit set actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub removed: Vec<Pair>,
    pub added: Vec<Pair>,
    pub conflicts: Vec<Conflict>,
    /// Additions without a known host IP
    pub skipped: Vec<Pair>,
}

impl ApplyReport {
    pub fn modified(&self) -> bool {
        !self.removed.is_empty() || !self.added.is_empty()
    }
}

/// The flat `<host-ip> <dns-name>` document read by the DNS server.
/// Lines this daemon never wrote are kept; the document is persisted sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputDocument {
    lines: BTreeSet<String>,
}

impl OutputDocument {
    /// Read the document at `path`. A missing file is an empty document.
    pub fn load(path: &Path) -> Result<Self, OutputError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(OutputError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn parse(contents: &str) -> Self {
        let lines = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self { lines }
    }

    /// Apply removals, then additions in order, rejecting additions that
    /// conflict with a name already present.
    pub fn apply(&mut self, edits: &EditSet) -> ApplyReport {
        let mut report = ApplyReport::default();

        for pair in &edits.removals {
            let before = self.lines.len();
            self.lines.retain(|line| Pair::parse(line).as_ref() != Some(pair));
            if self.lines.len() != before {
                report.removed.push(pair.clone());
            }
        }

        for pair in &edits.additions {
            if pair.is_unknown_host() {
                report.skipped.push(pair.clone());
                continue;
            }
            if self.has_pair(pair) {
                continue;
            }
            if let Some(existing) = self.conflicting_line(pair) {
                report.conflicts.push(Conflict {
                    rejected: pair.clone(),
                    existing: existing.to_string(),
                });
                continue;
            }
            self.lines.insert(pair.as_str().to_string());
            report.added.push(pair.clone());
        }

        report
    }

    fn has_pair(&self, pair: &Pair) -> bool {
        self.lines
            .iter()
            .any(|line| Pair::parse(line).as_ref() == Some(pair))
    }

    /// First line mapping the pair's DNS name to a different host IP
    fn conflicting_line(&self, pair: &Pair) -> Option<&str> {
        self.lines
            .iter()
            .filter(|line| !line.starts_with('#'))
            .find(|line| {
                let mut tokens = line.split_whitespace();
                let Some(host_ip) = tokens.next() else {
                    return false;
                };
                host_ip != pair.host_ip() && tokens.any(|name| name == pair.dns_name())
            })
            .map(String::as_str)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Atomically replace the file at `path` with the rendered document
    pub fn save(&self, path: &Path) -> Result<(), OutputError> {
        write_atomic(path, self.render().as_bytes()).map_err(|source| OutputError::Write {
            path: PathBuf::from(path),
            source,
        })
    }
}
