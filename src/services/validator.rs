//! Dry validation of a corpus file, without embedding anything.

use std::collections::{BTreeMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::loader::parse_record;
use crate::error::LoaderError;

pub const MIN_TEXT_CHARS: usize = 10;
pub const MAX_TEXT_CHARS: usize = 16384;

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid id pattern"));
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid pattern"));
static LETTERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+").expect("valid pattern"));

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationStats {
    pub total_lines: u64,
    pub valid_docs: u64,
    pub blank_lines: u64,
    pub json_errors: u64,
    pub invalid_records: u64,
    pub duplicate_ids: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_length: Option<LengthStats>,
    /// Shape of ids with digit runs as `N` and letter runs as `A`.
    pub id_patterns: BTreeMap<String, u64>,
    pub source_patterns: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LengthStats {
    pub min: usize,
    pub max: usize,
    pub avg: f64,
    pub median: usize,
}

impl LengthStats {
    pub fn from_lengths(mut lengths: Vec<usize>) -> Option<Self> {
        if lengths.is_empty() {
            return None;
        }
        lengths.sort_unstable();
        let total: usize = lengths.iter().sum();
        Some(Self {
            min: lengths[0],
            max: lengths[lengths.len() - 1],
            avg: total as f64 / lengths.len() as f64,
            median: lengths[lengths.len() / 2],
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub file_path: String,
    pub passed: bool,
    pub stats: ValidationStats,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Most frequent patterns first, ties broken alphabetically.
    pub fn top_patterns(patterns: &BTreeMap<String, u64>, n: usize) -> Vec<(&str, u64)> {
        let mut sorted: Vec<(&str, u64)> = patterns.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        sorted.truncate(n);
        sorted
    }
}

pub fn validate_corpus(path: &Path) -> Result<ValidationReport, LoaderError> {
    let file = std::fs::File::open(path).map_err(|source| LoaderError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut report = validate_reader(BufReader::new(file))?;
    report.file_path = path.display().to_string();
    Ok(report)
}

pub fn validate_reader<R: BufRead>(mut reader: R) -> Result<ValidationReport, LoaderError> {
    let mut stats = ValidationStats::default();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut seen = HashSet::new();
    let mut lengths = Vec::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let line_no = stats.total_lines + 1;
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|source| LoaderError::Read {
                line: line_no,
                source,
            })?;
        if read == 0 {
            break;
        }
        stats.total_lines = line_no;

        let Ok(line) = std::str::from_utf8(&buf) else {
            stats.json_errors += 1;
            errors.push(format!("line {line_no}: invalid UTF-8"));
            continue;
        };
        if line.trim().is_empty() {
            stats.blank_lines += 1;
            continue;
        }

        if let Err(e) = serde_json::from_str::<serde_json::Value>(line) {
            stats.json_errors += 1;
            errors.push(format!("line {line_no}: invalid JSON: {e}"));
            continue;
        }

        let doc = match parse_record(line, line_no) {
            Ok(doc) => doc,
            Err(e) => {
                stats.invalid_records += 1;
                errors.push(format!("line {line_no}: {}", e.reason));
                continue;
            }
        };

        stats.valid_docs += 1;
        if !seen.insert(doc.id.clone()) {
            stats.duplicate_ids += 1;
            errors.push(format!("line {line_no}: duplicate id '{}'", doc.id));
            continue;
        }

        let chars = doc.text.chars().count();
        if chars < MIN_TEXT_CHARS {
            warnings.push(format!("line {line_no}: text is short ({chars} chars)"));
        } else if chars > MAX_TEXT_CHARS {
            warnings.push(format!("line {line_no}: text is long ({chars} chars)"));
        }
        if !ID_PATTERN.is_match(&doc.id) {
            warnings.push(format!(
                "line {line_no}: id contains special characters: {}",
                doc.id
            ));
        }
        if doc.source.trim().is_empty() {
            warnings.push(format!("line {line_no}: field `source` is empty"));
        }

        lengths.push(chars);
        *stats.id_patterns.entry(shape_of(&doc.id)).or_default() += 1;
        *stats.source_patterns.entry(shape_of(&doc.source)).or_default() += 1;
    }

    stats.text_length = LengthStats::from_lengths(lengths);

    Ok(ValidationReport {
        file_path: String::new(),
        passed: errors.is_empty(),
        stats,
        errors,
        warnings,
    })
}

/// Collapse letter runs to `A` and digit runs to `N`. Letters go first so the
/// `N` placeholder is never rewritten.
fn shape_of(value: &str) -> String {
    let letters = LETTERS.replace_all(value, "A");
    DIGITS.replace_all(&letters, "N").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn validate(input: &str) -> ValidationReport {
        validate_reader(Cursor::new(input.as_bytes().to_vec())).unwrap()
    }

    #[test]
    fn test_clean_corpus_passes() {
        let report = validate(concat!(
            r#"{"id": "doc_1", "text": "a reasonably long text", "source": "a.txt"}"#,
            "\n\n",
            r#"{"id": "doc_2", "text": "another reasonably long text", "source": "b.txt"}"#,
            "\n",
        ));
        assert!(report.passed);
        assert_eq!(report.stats.total_lines, 3);
        assert_eq!(report.stats.blank_lines, 1);
        assert_eq!(report.stats.valid_docs, 2);
        assert!(report.warnings.is_empty());
        assert_eq!(report.stats.id_patterns.get("A_N"), Some(&2));
        assert_eq!(report.stats.source_patterns.get("A.A"), Some(&2));
    }

    #[test]
    fn test_errors_fail_validation() {
        let report = validate(concat!(
            "not json\n",
            r#"{"id": "a", "source": "s"}"#,
            "\n",
            r#"{"id": "b", "text": "some text here", "source": "s"}"#,
            "\n",
            r#"{"id": "b", "text": "some text here", "source": "s"}"#,
            "\n",
        ));
        assert!(!report.passed);
        assert_eq!(report.stats.json_errors, 1);
        assert_eq!(report.stats.invalid_records, 1);
        assert_eq!(report.stats.duplicate_ids, 1);
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors[0].starts_with("line 1:"));
        assert!(report.errors[2].contains("duplicate id 'b'"));
    }

    #[test]
    fn test_warnings_do_not_fail_validation() {
        let long = "x".repeat(MAX_TEXT_CHARS + 1);
        let input = format!(
            "{}\n{}\n",
            r#"{"id": "a b", "text": "tiny", "source": "s"}"#,
            serde_json::json!({"id": "c", "text": long, "source": "s"})
        );
        let report = validate(&input);
        assert!(report.passed);
        assert_eq!(report.warnings.len(), 3);
        assert!(report.warnings[0].contains("short (4 chars)"));
        assert!(report.warnings[1].contains("special characters"));
        assert!(report.warnings[2].contains("long"));
    }

    #[test]
    fn test_length_stats() {
        let stats = LengthStats::from_lengths(vec![30, 10, 20, 40]).unwrap();
        assert_eq!(stats.min, 10);
        assert_eq!(stats.max, 40);
        assert_eq!(stats.median, 30);
        assert!((stats.avg - 25.0).abs() < f64::EPSILON);
        assert!(LengthStats::from_lengths(Vec::new()).is_none());
    }

    #[test]
    fn test_shape_keeps_letters_and_digits_apart() {
        assert_eq!(shape_of("doc_1"), "A_N");
        assert_eq!(shape_of("doc_0042"), "A_N");
        assert_eq!(shape_of("2024-report-v3"), "N-A-AN");
        assert_eq!(shape_of("papers/a1b2.pdf"), "A/ANAN.A");
    }

    #[test]
    fn test_top_patterns_orders_by_count() {
        let mut patterns = BTreeMap::new();
        patterns.insert("A".to_string(), 1);
        patterns.insert("N".to_string(), 3);
        patterns.insert("A_N".to_string(), 3);
        let top = ValidationReport::top_patterns(&patterns, 2);
        assert_eq!(top, vec![("A_N", 3), ("N", 3)]);
    }
}
