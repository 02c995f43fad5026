//! Crash report pipeline
//!
//! Finds the Nth newest report under `<servers>/<server>/crash-reports/`,
//! parses the parts worth showing to an operator and packs them into
//! chunks small enough for the chat transport.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Chat transport message limit.
pub const DEFAULT_CHUNK_SIZE: usize = 2000;
/// Stack trace lines shown in the header chunk.
const HEADER_TRACE_LINES: usize = 4;

#[derive(Error, Debug)]
pub enum CrashReportError {
    #[error("no crash report #{ordinal} available for '{server}'")]
    NotFound { server: String, ordinal: usize },

    #[error("failed to read crash report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("crash report task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSection {
    pub title: &'static str,
    pub lines: Vec<String>,
}

impl ReportSection {
    fn new(title: &'static str) -> Self {
        Self { title, lines: Vec::new() }
    }

    /// Heading line followed by the body, newline-terminated.
    fn rendered_lines(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(format!("# {}:\n", self.title))
            .chain(self.lines.iter().map(|l| format!("{}\n", l)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashReport {
    pub path: PathBuf,
    pub flavor: String,
    pub time: String,
    pub description: String,
    pub stack_trace: Vec<String>,
    pub affected_level: Option<ReportSection>,
    pub block_entity: Option<ReportSection>,
    pub phase_tracker: Option<ReportSection>,
}

impl CrashReport {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn sections(&self) -> impl Iterator<Item = &ReportSection> {
        [&self.affected_level, &self.block_entity, &self.phase_tracker]
            .into_iter()
            .flatten()
    }
}

// ─── Locate ──────────────────────────────────────────────────

pub fn crash_dir(servers_path: &Path, server: &str) -> PathBuf {
    servers_path.join(server).join("crash-reports")
}

/// All report files for a server, newest first.
///
/// A missing or unreadable directory is just "no reports yet".
pub fn list_reports(servers_path: &Path, server: &str) -> Vec<(PathBuf, SystemTime)> {
    let dir = crash_dir(servers_path, server);
    let pattern = format!("{}/*", glob::Pattern::escape(&dir.to_string_lossy()));

    let mut reports: Vec<(PathBuf, SystemTime)> = match glob::glob(&pattern) {
        Ok(paths) => paths
            .flatten()
            .filter_map(|path| {
                let meta = path.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                let mtime = meta.modified().ok()?;
                Some((path, mtime))
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Invalid crash report pattern '{}': {}", pattern, e);
            Vec::new()
        }
    };

    reports.sort_by(|a, b| b.1.cmp(&a.1));
    reports
}

/// The `ordinal`-th newest report (0 = newest) and its mtime.
pub fn locate(
    servers_path: &Path,
    server: &str,
    ordinal: usize,
) -> Result<(PathBuf, SystemTime), CrashReportError> {
    list_reports(servers_path, server)
        .into_iter()
        .nth(ordinal)
        .ok_or_else(|| CrashReportError::NotFound {
            server: server.to_string(),
            ordinal,
        })
}

// ─── Parse ───────────────────────────────────────────────────

/// Line reader that survives invalid UTF-8 and CRLF files.
struct Lines<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: BufRead> Lines<R> {
    fn new(inner: R) -> Self {
        Self { inner, buf: Vec::new() }
    }

    fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        if self.inner.read_until(b'\n', &mut self.buf)? == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }

    fn next_non_blank(&mut self) -> io::Result<Option<String>> {
        while let Some(line) = self.next_line()? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// Collects lines until a blank line, EOF, or `stop` says so.
    fn read_block(&mut self, stop: impl Fn(&str) -> bool) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line()? {
            if line.trim().is_empty() || stop(&line) {
                break;
            }
            lines.push(line);
        }
        Ok(lines)
    }
}

/// Parses a report best-effort; missing parts stay empty.
pub fn parse(path: &Path) -> Result<CrashReport, CrashReportError> {
    let io_err = |source| CrashReportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut report = parse_from(BufReader::new(file)).map_err(io_err)?;
    report.path = path.to_path_buf();
    Ok(report)
}

fn parse_from<R: BufRead>(reader: R) -> io::Result<CrashReport> {
    let mut lines = Lines::new(reader);
    let mut report = CrashReport::default();

    // flavor text가 나올 때까지 버림
    let mut found_flavor = false;
    while let Some(line) = lines.next_line()? {
        if line.starts_with("// ") {
            report.flavor = line;
            found_flavor = true;
            break;
        }
    }
    if !found_flavor {
        tracing::debug!("Crash report has no flavor text, nothing to parse");
        return Ok(report);
    }

    // Time / Description
    if let Some(time) = lines.next_non_blank()? {
        report.time = time;
        if let Some(desc) = lines.next_line()? {
            if !desc.trim().is_empty() {
                report.description = desc;
            }
        }
    }

    // 짧은 스택트레이스: 빈 줄까지 (앞의 빈 줄은 없을 수도 있다)
    if let Some(first) = lines.next_non_blank()? {
        report.stack_trace.push(first);
        report.stack_trace.extend(lines.read_block(|_| false)?);
    }

    while let Some(line) = lines.next_line()? {
        if line.starts_with("-- Block") && report.block_entity.is_none() {
            let mut section = ReportSection::new("Block entity being ticked");
            section.lines = lines.read_block(|l| l == "Stacktrace:")?;
            report.block_entity = Some(section);
        } else if line.starts_with("-- Affected") && report.affected_level.is_none() {
            let mut section = ReportSection::new("Affected level");
            section.lines = lines.read_block(|_| false)?;
            report.affected_level = Some(section);
        } else if line.starts_with("-- Sponge") && report.phase_tracker.is_none() {
            // 헤더 뒤 두 줄은 배너
            lines.next_line()?;
            lines.next_line()?;
            let body = lines.read_block(|l| l.starts_with("/***"))?;
            if !body.is_empty() {
                let mut section = ReportSection::new("Sponge PhaseTracker");
                section.lines = body;
                report.phase_tracker = Some(section);
            }
        }
    }

    Ok(report)
}

// ─── Format ──────────────────────────────────────────────────

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Splits `s` into pieces of at most `max` characters.
fn split_chars(s: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    chars.chunks(max.max(1)).map(|c| c.iter().collect()).collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn render_header(report: &CrashReport) -> String {
    let mut header = String::new();
    header.push_str(&format!("> {}\n", report.file_name()));
    header.push_str(&format!("# {}\n\n", report.flavor));
    header.push_str(&format!("# {}\n", report.time));
    header.push_str(&format!("# {}\n\n", report.description));
    header.push_str("# Shortened Stacktrace:\n");
    for line in report.stack_trace.iter().take(HEADER_TRACE_LINES) {
        header.push_str(line);
        header.push('\n');
    }
    header
}

/// Lazily packed report chunks, each at most `max_chunk` characters.
///
/// Consumed once; the caller should pause between sends.
pub struct ReportChunks {
    header: Option<String>,
    pieces: std::vec::IntoIter<String>,
    current: String,
    current_len: usize,
    max_chunk: usize,
}

impl Iterator for ReportChunks {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if let Some(header) = self.header.take() {
            return Some(header);
        }

        for piece in self.pieces.by_ref() {
            let piece_len = char_len(&piece);
            if self.current_len + piece_len <= self.max_chunk {
                self.current.push_str(&piece);
                self.current_len += piece_len;
                continue;
            }
            let full = std::mem::replace(&mut self.current, piece);
            self.current_len = piece_len;
            if !full.is_empty() {
                return Some(full);
            }
        }

        if self.current.is_empty() {
            None
        } else {
            self.current_len = 0;
            Some(std::mem::take(&mut self.current))
        }
    }
}

pub fn format_chunks(report: &CrashReport, max_chunk: usize) -> ReportChunks {
    let max_chunk = max_chunk.max(1);
    let pieces: Vec<String> = report
        .sections()
        .flat_map(|s| s.rendered_lines())
        .flat_map(|line| {
            if char_len(&line) > max_chunk {
                split_chars(&line, max_chunk)
            } else {
                vec![line]
            }
        })
        .collect();

    ReportChunks {
        header: Some(truncate_chars(&render_header(report), max_chunk)),
        pieces: pieces.into_iter(),
        current: String::new(),
        current_len: 0,
        max_chunk,
    }
}

/// Parses and chunks a known report file off the async runtime.
pub async fn read_path_chunks(path: PathBuf, max_chunk: usize) -> Result<Vec<String>, CrashReportError> {
    tokio::task::spawn_blocking(move || {
        let report = parse(&path)?;
        Ok(format_chunks(&report, max_chunk).collect())
    })
    .await
    .map_err(|e| CrashReportError::Task(e.to_string()))?
}

// ─── Reader handle ───────────────────────────────────────────

/// Crash report access rooted at the servers directory.
#[derive(Debug, Clone)]
pub struct CrashReports {
    servers_path: PathBuf,
}

impl CrashReports {
    pub fn new(servers_path: impl Into<PathBuf>) -> Self {
        Self {
            servers_path: servers_path.into(),
        }
    }

    pub fn locate(&self, server: &str, ordinal: usize) -> Result<(PathBuf, SystemTime), CrashReportError> {
        locate(&self.servers_path, server, ordinal)
    }

    /// Newest report, if any.
    pub fn latest(&self, server: &str) -> Option<(PathBuf, SystemTime)> {
        self.locate(server, 0).ok()
    }

    /// Locates, parses and chunks off the async runtime.
    pub async fn read_chunks(
        &self,
        server: &str,
        ordinal: usize,
        max_chunk: usize,
    ) -> Result<Vec<String>, CrashReportError> {
        let this = self.clone();
        let server = server.to_string();
        let (path, _) = tokio::task::spawn_blocking(move || this.locate(&server, ordinal))
            .await
            .map_err(|e| CrashReportError::Task(e.to_string()))??;
        read_path_chunks(path, max_chunk).await
    }

    pub async fn latest_async(&self, server: &str) -> Result<Option<(PathBuf, SystemTime)>, CrashReportError> {
        let this = self.clone();
        let server = server.to_string();
        tokio::task::spawn_blocking(move || this.latest(&server))
            .await
            .map_err(|e| CrashReportError::Task(e.to_string()))
    }
}
