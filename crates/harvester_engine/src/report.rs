use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use engine_logging::{engine_info, engine_warn};
use harvester_core::{HarvestSession, ResultMap, ResultRecord};

use crate::persist::{write_file, PersistError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Tsv,
}

impl OutputFormat {
    /// Infer the format from a `.json` or `.tsv` file name suffix.
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?;
        if extension.eq_ignore_ascii_case("json") {
            Some(OutputFormat::Json)
        } else if extension.eq_ignore_ascii_case("tsv") {
            Some(OutputFormat::Tsv)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Tsv => "tsv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTarget {
    pub format: OutputFormat,
    pub destination: Destination,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to serialize results: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write report: {0}")]
    Persist(#[from] PersistError),
    #[error("failed to write to stdout: {0}")]
    Stdout(#[from] std::io::Error),
}

/// Where results and the failure log go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportOptions {
    /// Format forced by `--json`/`--tab`.
    pub format: Option<OutputFormat>,
    pub out: Option<PathBuf>,
    /// Path stem for sibling `.json`, `.tsv` and `.log` files.
    pub prefix: Option<PathBuf>,
}

impl ReportOptions {
    pub fn targets(&self) -> Vec<ReportTarget> {
        let out = || match &self.out {
            Some(path) => Destination::File(path.clone()),
            None => Destination::Stdout,
        };
        if let Some(format) = self.format {
            return vec![ReportTarget {
                format,
                destination: out(),
            }];
        }
        if let Some(format) = self.out.as_deref().and_then(OutputFormat::from_path) {
            return vec![ReportTarget {
                format,
                destination: out(),
            }];
        }
        if let Some(prefix) = &self.prefix {
            return [OutputFormat::Json, OutputFormat::Tsv]
                .into_iter()
                .map(|format| ReportTarget {
                    format,
                    destination: Destination::File(with_suffix(prefix, format.extension())),
                })
                .collect();
        }
        vec![ReportTarget {
            format: OutputFormat::Tsv,
            destination: out(),
        }]
    }

    /// `<prefix>.log`, else `<out>.log`, else `harvest.log`.
    pub fn failure_log_path(&self) -> PathBuf {
        let stem = self
            .prefix
            .as_deref()
            .or(self.out.as_deref())
            .unwrap_or_else(|| Path::new("harvest"));
        with_suffix(stem, "log")
    }
}

fn with_suffix(stem: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(stem.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Results as a JSON object keyed by URL; non-ASCII text is written as-is.
pub fn render_json(results: &ResultMap) -> Result<String, ReportError> {
    Ok(serde_json::to_string_pretty(results)?)
}

/// Results as tab-separated rows in input URL order.
///
/// Columns are `url`, the query fields, then any `extra_columns` not already
/// present. Empty values are skipped and the rest joined with `"; "`.
pub fn render_tsv(session: &HarvestSession, extra_columns: &[String]) -> String {
    let mut columns: Vec<&str> = session.queries().field_names().collect();
    for extra in extra_columns {
        if !columns.contains(&extra.as_str()) {
            columns.push(extra);
        }
    }

    let mut out = String::from("url");
    for column in &columns {
        out.push('\t');
        out.push_str(&sanitize(column));
    }
    out.push('\n');

    let mut seen = BTreeSet::new();
    for url in session.urls() {
        if !seen.insert(url.as_str()) {
            continue;
        }
        let Some(record) = session.results().get(url) else {
            continue;
        };
        out.push_str(&sanitize(url));
        for column in &columns {
            out.push('\t');
            out.push_str(&join_values(record, column));
        }
        out.push('\n');
    }
    out
}

fn join_values(record: &ResultRecord, field: &str) -> String {
    record
        .get(field)
        .map(|values| {
            values
                .iter()
                .filter(|value| !value.is_empty())
                .map(|value| sanitize(value))
                .collect::<Vec<_>>()
                .join("; ")
        })
        .unwrap_or_default()
}

fn sanitize(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// One failed URL per line.
pub fn render_failures(failures: &[String]) -> String {
    failures.iter().map(|url| format!("{url}\n")).collect()
}

/// Writes harvest results and the failure log according to [`ReportOptions`].
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    options: ReportOptions,
    extra_columns: Vec<String>,
}

impl Reporter {
    pub fn new(options: ReportOptions) -> Self {
        Self {
            options,
            extra_columns: Vec::new(),
        }
    }

    /// Columns appended after the query fields in TSV output.
    pub fn with_extra_columns(mut self, columns: Vec<String>) -> Self {
        self.extra_columns = columns;
        self
    }

    pub fn options(&self) -> &ReportOptions {
        &self.options
    }

    /// Writes every target. Nothing is written when no URL succeeded.
    pub fn write_results(&self, session: &HarvestSession) -> Result<Vec<Destination>, ReportError> {
        if session.results().is_empty() {
            engine_warn!("no url was harvested; skipping result output");
            return Ok(Vec::new());
        }
        let mut written = Vec::new();
        for target in self.options.targets() {
            let content = match target.format {
                OutputFormat::Json => render_json(session.results())?,
                OutputFormat::Tsv => render_tsv(session, &self.extra_columns),
            };
            match &target.destination {
                Destination::Stdout => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(content.as_bytes())?;
                    stdout.flush()?;
                }
                Destination::File(path) => {
                    write_file(path, &content)?;
                    engine_info!("wrote {} results to {}", target.format.extension(), path.display());
                }
            }
            written.push(target.destination);
        }
        Ok(written)
    }

    /// Writes the failure log when any URL failed; returns its path.
    pub fn write_failures(&self, session: &HarvestSession) -> Result<Option<PathBuf>, ReportError> {
        if session.failures().is_empty() {
            return Ok(None);
        }
        let path = self.options.failure_log_path();
        write_file(&path, render_failures(session.failures()))?;
        engine_warn!("{} failed urls listed in {}", session.failures().len(), path.display());
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_is_inferred_from_suffix() {
        assert_eq!(OutputFormat::from_path(Path::new("out.JSON")), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_path(Path::new("a/b.tsv")), Some(OutputFormat::Tsv));
        assert_eq!(OutputFormat::from_path(Path::new("out.txt")), None);
    }

    #[test]
    fn sanitize_keeps_rows_on_one_line() {
        assert_eq!(sanitize("a\tb\r\nc"), "a b  c");
    }
}
