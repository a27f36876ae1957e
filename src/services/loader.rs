//! Streaming JSONL corpus loader.
//!
//! Records are read lazily one line at a time, validated, normalized and
//! yielded as [`Document`]s. The loader can start from a logical line offset
//! and skip ids that a previous run already committed.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{LoaderError, MalformedRecordError};
use crate::models::{Document, DuplicatePolicy, MalformedPolicy, Metadata, MetadataValue};
use crate::utils::normalize_text;

/// Upper bound on individual malformed records kept for the run summary.
pub const MAX_REPORTED_ERRORS: usize = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoaderOptions {
    pub malformed_policy: MalformedPolicy,
    pub duplicate_policy: DuplicatePolicy,
    /// Number of leading lines to skip without parsing.
    pub start_offset: u64,
}

/// Counters accumulated while streaming the corpus.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoaderStats {
    /// Non-blank lines read after the start offset.
    pub total_records: u64,
    pub loaded: u64,
    pub blank_lines: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub already_processed: u64,
    /// First [`MAX_REPORTED_ERRORS`] malformed records.
    pub errors: Vec<MalformedRecordError>,
}

impl LoaderStats {
    pub fn skipped(&self) -> u64 {
        self.malformed + self.duplicates + self.already_processed
    }
}

pub struct RecordLoader<R> {
    reader: R,
    options: LoaderOptions,
    line: u64,
    seen: HashSet<String>,
    processed: HashSet<String>,
    stats: LoaderStats,
    buf: Vec<u8>,
    done: bool,
}

impl RecordLoader<BufReader<File>> {
    pub fn open(path: &Path, options: LoaderOptions) -> Result<Self, LoaderError> {
        let file = File::open(path).map_err(|source| LoaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_reader(BufReader::new(file), options))
    }
}

impl<R: BufRead> RecordLoader<R> {
    pub fn from_reader(reader: R, options: LoaderOptions) -> Self {
        Self {
            reader,
            options,
            line: 0,
            seen: HashSet::new(),
            processed: HashSet::new(),
            stats: LoaderStats::default(),
            buf: Vec::new(),
            done: false,
        }
    }

    /// Ids that were embedded by an earlier run and must not be yielded again.
    #[must_use]
    pub fn with_processed_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.processed = ids.into_iter().collect();
        self
    }

    pub fn stats(&self) -> &LoaderStats {
        &self.stats
    }

    pub fn into_stats(self) -> LoaderStats {
        self.stats
    }

    /// 1-based number of the last line read.
    pub fn line(&self) -> u64 {
        self.line
    }

    fn read_line(&mut self) -> Result<bool, LoaderError> {
        self.buf.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|source| LoaderError::Read {
                line: self.line + 1,
                source,
            })?;
        if n == 0 {
            return Ok(false);
        }
        self.line += 1;
        Ok(true)
    }

    fn skip_to_offset(&mut self) -> Result<bool, LoaderError> {
        while self.line < self.options.start_offset {
            if !self.read_line()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn record_malformed(&mut self, err: MalformedRecordError) -> Option<LoaderError> {
        match self.options.malformed_policy {
            MalformedPolicy::Abort => Some(LoaderError::Malformed(err)),
            MalformedPolicy::Skip => {
                warn!(line = err.line, reason = %err.reason, "skipping malformed record");
                self.stats.malformed += 1;
                if self.stats.errors.len() < MAX_REPORTED_ERRORS {
                    self.stats.errors.push(err);
                }
                None
            }
        }
    }

    fn next_record(&mut self) -> Result<Option<Document>, LoaderError> {
        if !self.skip_to_offset()? {
            return Ok(None);
        }

        loop {
            if !self.read_line()? {
                return Ok(None);
            }

            let line_no = self.line;
            let parsed = match std::str::from_utf8(&self.buf) {
                Ok(text) if text.trim().is_empty() => {
                    self.stats.blank_lines += 1;
                    continue;
                }
                Ok(text) => parse_record(text, line_no),
                Err(e) => Err(MalformedRecordError {
                    line: line_no,
                    reason: format!("invalid UTF-8: {e}"),
                }),
            };
            self.stats.total_records += 1;

            let document = match parsed {
                Ok(doc) => doc,
                Err(err) => match self.record_malformed(err) {
                    Some(fatal) => return Err(fatal),
                    None => continue,
                },
            };

            if self.processed.contains(&document.id) {
                debug!(id = %document.id, "already embedded by a previous run");
                self.stats.already_processed += 1;
                self.seen.insert(document.id);
                continue;
            }

            if !self.seen.insert(document.id.clone()) {
                match self.options.duplicate_policy {
                    DuplicatePolicy::Reject => {
                        return Err(LoaderError::DuplicateId {
                            id: document.id,
                            line: line_no,
                        });
                    }
                    DuplicatePolicy::Skip => {
                        warn!(id = %document.id, line = line_no, "skipping duplicate id");
                        self.stats.duplicates += 1;
                        continue;
                    }
                }
            }

            self.stats.loaded += 1;
            return Ok(Some(document));
        }
    }
}

impl<R: BufRead> Iterator for RecordLoader<R> {
    type Item = Result<Document, LoaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(doc)) => Some(Ok(doc)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse and normalize one non-blank corpus line.
pub fn parse_record(line: &str, line_no: u64) -> Result<Document, MalformedRecordError> {
    let malformed = |reason: String| MalformedRecordError {
        line: line_no,
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| malformed(format!("invalid JSON: {e}")))?;
    let serde_json::Value::Object(mut obj) = value else {
        return Err(malformed("record is not a JSON object".into()));
    };

    let mut take_string = |field: &str| match obj.remove(field) {
        Some(serde_json::Value::String(s)) => Ok(s),
        Some(_) => Err(malformed(format!("field `{field}` must be a string"))),
        None => Err(malformed(format!("missing field `{field}`"))),
    };

    let id = take_string("id")?;
    let text = take_string("text")?;
    let source = take_string("source")?;

    let id = id.trim().to_string();
    if id.is_empty() {
        return Err(malformed("field `id` is empty".into()));
    }

    let text = normalize_text(&text);
    if text.is_empty() {
        return Err(malformed("text is empty after normalization".into()));
    }

    let mut metadata = Metadata::new();
    match obj.remove("metadata") {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::Object(map)) => {
            for (key, value) in map {
                let scalar = MetadataValue::from_json(value)
                    .ok_or_else(|| malformed(format!("metadata `{key}` is not a scalar")))?;
                metadata.insert(key, scalar);
            }
        }
        Some(_) => return Err(malformed("field `metadata` must be an object".into())),
    }

    Ok(Document {
        id,
        text,
        source,
        metadata,
        line: line_no,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn loader(input: &str, options: LoaderOptions) -> RecordLoader<Cursor<Vec<u8>>> {
        RecordLoader::from_reader(Cursor::new(input.as_bytes().to_vec()), options)
    }

    #[test]
    fn test_parse_record_valid() {
        let doc = parse_record(
            r#"{"id": "a1", "text": "  hello ", "source": "f.txt", "metadata": {"page": 2}}"#,
            3,
        )
        .unwrap();
        assert_eq!(doc.id, "a1");
        assert_eq!(doc.text, "hello");
        assert_eq!(doc.source, "f.txt");
        assert_eq!(doc.line, 3);
        assert_eq!(doc.metadata.get("page"), Some(&MetadataValue::Int(2)));
    }

    #[test]
    fn test_parse_record_reports_line_and_field() {
        let err = parse_record(r#"{"id": "a", "source": "s"}"#, 9).unwrap_err();
        assert_eq!(err.line, 9);
        assert!(err.reason.contains("text"));

        let err = parse_record("not json", 2).unwrap_err();
        assert!(err.reason.starts_with("invalid JSON"));

        let err = parse_record(r#"{"id": 5, "text": "t", "source": "s"}"#, 1).unwrap_err();
        assert!(err.reason.contains("must be a string"));

        let err = parse_record(r#"{"id": "a", "text": "  \u0000 ", "source": "s"}"#, 1)
            .unwrap_err();
        assert!(err.reason.contains("empty"));

        let err = parse_record(
            r#"{"id": "a", "text": "t", "source": "s", "metadata": {"k": [1]}}"#,
            1,
        )
        .unwrap_err();
        assert!(err.reason.contains("scalar"));
    }

    #[test]
    fn test_blank_lines_ignored() {
        let input = "\n{\"id\":\"a\",\"text\":\"x\",\"source\":\"s\"}\n   \n{\"id\":\"b\",\"text\":\"y\",\"source\":\"s\"}";
        let mut l = loader(input, LoaderOptions::default());
        let docs: Vec<_> = l.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].line, 4);
        assert_eq!(l.stats().blank_lines, 2);
        assert_eq!(l.stats().total_records, 2);
    }

    #[test]
    fn test_skip_policy_counts_malformed() {
        let input = "{\"id\":\"a\",\"text\":\"x\",\"source\":\"s\"}\n{broken\n{\"id\":\"b\",\"text\":\"\",\"source\":\"s\"}\n{\"id\":\"c\",\"text\":\"z\",\"source\":\"s\"}\n";
        let mut l = loader(input, LoaderOptions::default());
        let ids: Vec<String> = l.by_ref().map(|d| d.unwrap().id).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let stats = l.into_stats();
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.errors[0].line, 2);
        assert_eq!(stats.errors[1].line, 3);
        assert_eq!(stats.loaded + stats.skipped(), stats.total_records);
    }

    #[test]
    fn test_abort_policy_stops_at_first_malformed() {
        let input = "{\"id\":\"a\",\"text\":\"x\",\"source\":\"s\"}\n{broken\n{\"id\":\"c\",\"text\":\"z\",\"source\":\"s\"}\n";
        let options = LoaderOptions {
            malformed_policy: MalformedPolicy::Abort,
            ..Default::default()
        };
        let mut l = loader(input, options);
        assert!(l.next().unwrap().is_ok());
        match l.next() {
            Some(Err(LoaderError::Malformed(e))) => assert_eq!(e.line, 2),
            other => panic!("expected malformed error, got {other:?}"),
        }
        assert!(l.next().is_none());
    }

    #[test]
    fn test_duplicate_skip_keeps_first() {
        let input = "{\"id\":\"a\",\"text\":\"first\",\"source\":\"s\"}\n{\"id\":\"b\",\"text\":\"x\",\"source\":\"s\"}\n{\"id\":\"a\",\"text\":\"second\",\"source\":\"s\"}\n";
        let mut l = loader(input, LoaderOptions::default());
        let docs: Vec<Document> = l.by_ref().map(Result::unwrap).collect();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].text, "first");
        assert_eq!(l.stats().duplicates, 1);
    }

    #[test]
    fn test_duplicate_reject_is_fatal() {
        let input = "{\"id\":\"a\",\"text\":\"x\",\"source\":\"s\"}\n{\"id\":\"b\",\"text\":\"x\",\"source\":\"s\"}\n{\"id\":\"a\",\"text\":\"x\",\"source\":\"s\"}\n";
        let options = LoaderOptions {
            duplicate_policy: DuplicatePolicy::Reject,
            ..Default::default()
        };
        let results: Vec<_> = loader(input, options).collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(
            results[2],
            Err(LoaderError::DuplicateId { ref id, line: 3 }) if id == "a"
        ));
    }

    #[test]
    fn test_processed_ids_are_skipped() {
        let input = "{\"id\":\"a\",\"text\":\"x\",\"source\":\"s\"}\n{\"id\":\"b\",\"text\":\"y\",\"source\":\"s\"}\n";
        let mut l = loader(input, LoaderOptions::default()).with_processed_ids(["a".to_string()]);
        let ids: Vec<String> = l.by_ref().map(|d| d.unwrap().id).collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(l.stats().already_processed, 1);
        assert_eq!(l.stats().skipped(), 1);
    }

    #[test]
    fn test_start_offset_restarts_mid_file() {
        let input = "{\"id\":\"a\",\"text\":\"x\",\"source\":\"s\"}\n{\"id\":\"b\",\"text\":\"y\",\"source\":\"s\"}\n{\"id\":\"c\",\"text\":\"z\",\"source\":\"s\"}\n";
        let options = LoaderOptions {
            start_offset: 2,
            ..Default::default()
        };
        let docs: Vec<Document> = loader(input, options).map(Result::unwrap).collect();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "c");
        assert_eq!(docs[0].line, 3);
    }

    #[test]
    fn test_open_missing_file() {
        let err = RecordLoader::open(Path::new("/no/such/corpus.jsonl"), LoaderOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, LoaderError::Open { .. }));
    }
}
