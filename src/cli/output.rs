use std::fmt::Write as FmtWrite;
use std::path::Path;

use serde::Serialize;

use crate::analysis::AnalysisReport;
use crate::models::{Metadata, OutputFormat};
use crate::services::monitor::ResourceSnapshot;
use crate::services::pipeline::{RunCounts, RunSummary};
use crate::services::validator::{LengthStats, ValidationReport};

pub trait Formatter {
    fn format_run_summary(&self, summary: &RunSummary) -> String;
    /// Progress of a run that stopped before finalizing.
    fn format_run_counts(&self, counts: &RunCounts) -> String;
    fn format_validation(&self, report: &ValidationReport) -> String;
    fn format_analysis(&self, report: &AnalysisReport, artifact: &Path) -> String;
    fn format_status(&self, status: &StatusInfo) -> String;
    fn format_collections(&self, rows: &[CollectionRow]) -> String;
    fn format_collection_detail(&self, detail: &CollectionDetail) -> String;
    fn format_search(&self, results: &SearchOutput) -> String;
    fn format_message(&self, message: &str) -> String;
    fn format_error(&self, error: &str) -> String;
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub config_path: Option<String>,
    pub embedding_backend: String,
    pub embedding_model: String,
    pub embedding_target: String,
    pub embedding_ready: bool,
    pub vector_store_driver: String,
    pub vector_store_location: String,
    pub vector_store_connected: bool,
    pub collections: usize,
    pub resources: ResourceSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionRow {
    /// Logical name, when an alias points at the collection.
    pub name: Option<String>,
    pub collection: String,
    pub points: u64,
    pub dimension: usize,
    pub model: Option<String>,
    pub task: Option<String>,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleRecord {
    pub id: String,
    pub source: String,
    pub preview: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionDetail {
    pub row: CollectionRow,
    pub created_at: Option<String>,
    pub finalized_at: Option<String>,
    pub samples: Vec<SampleRecord>,
    pub text_length: Option<LengthStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHitRow {
    pub rank: usize,
    pub id: String,
    pub similarity: f32,
    pub source: String,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutput {
    pub collection: String,
    pub query: String,
    pub hits: Vec<SearchHitRow>,
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

pub struct TextFormatter;

impl Formatter for TextFormatter {
    fn format_run_counts(&self, c: &RunCounts) -> String {
        let mut output = String::new();
        writeln!(output, "Embedding Stopped").unwrap();
        writeln!(output, "-----------------").unwrap();
        writeln!(output, "Total records:   {}", c.total_records).unwrap();
        writeln!(output, "Processed:       {}", c.processed).unwrap();
        writeln!(
            output,
            "Skipped:         {} (malformed {}, duplicate {}, already processed {})",
            c.skipped.total(),
            c.skipped.malformed,
            c.skipped.duplicate,
            c.skipped.already_processed
        )
        .unwrap();
        writeln!(output, "Failed:          {}", c.failed).unwrap();
        writeln!(output, "Checkpointed:    {}", c.checkpointed).unwrap();
        output
    }

    fn format_run_summary(&self, s: &RunSummary) -> String {
        let mut output = String::new();
        writeln!(output, "Embedding Complete").unwrap();
        writeln!(output, "------------------").unwrap();
        writeln!(output, "Collection:      {} -> {}", s.name, s.collection).unwrap();
        writeln!(output, "Model:           {} ({})", s.model, s.task).unwrap();
        writeln!(output, "Store:           {}", s.store_location).unwrap();
        if s.resumed {
            writeln!(output, "Resumed:         yes").unwrap();
        }
        writeln!(output).unwrap();
        writeln!(output, "Total records:   {}", s.total_records).unwrap();
        writeln!(output, "Processed:       {}", s.processed).unwrap();
        writeln!(
            output,
            "Skipped:         {} (malformed {}, duplicate {}, already processed {})",
            s.skipped.total(),
            s.skipped.malformed,
            s.skipped.duplicate,
            s.skipped.already_processed
        )
        .unwrap();
        writeln!(output, "Failed:          {}", s.failed).unwrap();
        writeln!(output, "Truncated:       {}", s.truncated).unwrap();
        writeln!(output, "Tokens:          {}", s.tokens).unwrap();
        writeln!(output).unwrap();
        writeln!(output, "Elapsed:         {:.1}s", s.elapsed_secs).unwrap();
        writeln!(output, "Throughput:      {:.1} docs/s, {:.0} tokens/s", s.docs_per_sec, s.tokens_per_sec).unwrap();
        writeln!(
            output,
            "Batches:         {} (final size {}, {} retries)",
            s.batches, s.final_batch_size, s.retries
        )
        .unwrap();
        writeln!(output, "In collection:   {}", s.documents_in_collection).unwrap();
        if let Some(ref old) = s.replaced_collection {
            writeln!(output, "Replaced:        {}", old).unwrap();
        }
        writeln!(output, "Resources:       {}", s.resources.short_summary()).unwrap();

        if !s.malformed_records.is_empty() {
            writeln!(output, "\nMalformed records:").unwrap();
            for e in s.malformed_records.iter().take(10) {
                writeln!(output, "  line {}: {}", e.line, e.reason).unwrap();
            }
            if s.malformed_records.len() > 10 {
                writeln!(output, "  ... and {} more", s.malformed_records.len() - 10).unwrap();
            }
        }
        if !s.failures.is_empty() {
            writeln!(output, "\nRejected batches:").unwrap();
            for f in &s.failures {
                writeln!(output, "  {} documents: {}", f.ids.len(), f.reason).unwrap();
            }
        }
        output
    }

    fn format_validation(&self, r: &ValidationReport) -> String {
        let mut output = String::new();
        let stats = &r.stats;
        writeln!(output, "Validation: {}", r.file_path).unwrap();
        writeln!(output, "----------").unwrap();
        writeln!(output, "Total lines:     {}", stats.total_lines).unwrap();
        writeln!(output, "Valid documents: {}", stats.valid_docs).unwrap();
        writeln!(output, "Blank lines:     {}", stats.blank_lines).unwrap();
        writeln!(output, "JSON errors:     {}", stats.json_errors).unwrap();
        writeln!(output, "Invalid records: {}", stats.invalid_records).unwrap();
        writeln!(output, "Duplicate ids:   {}", stats.duplicate_ids).unwrap();

        if let Some(ref len) = stats.text_length {
            writeln!(output, "\nText length (chars):").unwrap();
            writeln!(
                output,
                "  min {}  max {}  avg {:.0}  median {}",
                len.min, len.max, len.avg, len.median
            )
            .unwrap();
        }

        let ids = ValidationReport::top_patterns(&stats.id_patterns, 5);
        if !ids.is_empty() {
            writeln!(output, "\nId patterns:").unwrap();
            for (pattern, count) in ids {
                writeln!(output, "  {}: {}", pattern, count).unwrap();
            }
        }
        let sources = ValidationReport::top_patterns(&stats.source_patterns, 5);
        if !sources.is_empty() {
            writeln!(output, "\nSource patterns:").unwrap();
            for (pattern, count) in sources {
                writeln!(output, "  {}: {}", pattern, count).unwrap();
            }
        }

        for (label, items) in [("Errors", &r.errors), ("Warnings", &r.warnings)] {
            if items.is_empty() {
                continue;
            }
            writeln!(output, "\n{} ({}):", label, items.len()).unwrap();
            for item in items.iter().take(10) {
                writeln!(output, "  {}", item).unwrap();
            }
            if items.len() > 10 {
                writeln!(output, "  ... and {} more", items.len() - 10).unwrap();
            }
        }

        writeln!(
            output,
            "\n{}",
            if r.passed {
                "Validation passed."
            } else {
                "Validation failed."
            }
        )
        .unwrap();
        output
    }

    fn format_analysis(&self, r: &AnalysisReport, artifact: &Path) -> String {
        let mut output = String::new();
        writeln!(output, "Analysis Complete").unwrap();
        writeln!(output, "-----------------").unwrap();
        writeln!(output, "Collection: {} -> {}", r.name, r.collection).unwrap();
        writeln!(output, "Model:      {} ({} dims)", r.model_name, r.dimension).unwrap();
        writeln!(output, "Points:     {} of {}", r.assignments.len(), r.total_points).unwrap();
        writeln!(output, "Outliers:   {}", r.outliers).unwrap();
        writeln!(output, "Clusters:   {}", r.clusters).unwrap();
        for (c, size) in r.cluster_sizes.iter().enumerate() {
            writeln!(output, "  {:>3}: {}", c, size).unwrap();
        }
        writeln!(output, "Artifact:   {}", artifact.display()).unwrap();
        output
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        let mut output = String::new();
        writeln!(output, "Status").unwrap();
        writeln!(output, "------").unwrap();
        if let Some(ref path) = status.config_path {
            writeln!(output, "Config:        {}", path).unwrap();
        }

        let embed_status = if status.embedding_ready {
            "[READY]"
        } else {
            "[UNAVAILABLE]"
        };
        writeln!(
            output,
            "Embedding:     {} {}",
            status.embedding_backend, embed_status
        )
        .unwrap();
        writeln!(output, "  Model:       {}", status.embedding_model).unwrap();
        writeln!(output, "  Target:      {}", status.embedding_target).unwrap();
        writeln!(output).unwrap();

        let store_status = if status.vector_store_connected {
            "[CONNECTED]"
        } else {
            "[DISCONNECTED]"
        };
        writeln!(
            output,
            "Vector Store:  {} {}",
            status.vector_store_driver, store_status
        )
        .unwrap();
        writeln!(output, "  Location:    {}", status.vector_store_location).unwrap();
        if status.vector_store_connected {
            writeln!(output, "  Collections: {}", status.collections).unwrap();
        }
        writeln!(output).unwrap();

        let r = &status.resources;
        writeln!(output, "Resources").unwrap();
        writeln!(output, "  CPU:         {:.1}%", r.cpu_percent).unwrap();
        writeln!(
            output,
            "  Memory:      {:.1}% of {} MB",
            r.system_memory_percent(),
            r.system_memory_total_bytes / (1024 * 1024)
        )
        .unwrap();
        writeln!(output, "  Process RSS: {} MB", r.process_rss_mb()).unwrap();
        if r.gpus.is_empty() {
            writeln!(output, "  GPU:         not available").unwrap();
        }
        for gpu in &r.gpus {
            writeln!(
                output,
                "  GPU {}:       {} ({:.0}% util, {}/{} MB)",
                gpu.index, gpu.name, gpu.utilization_percent, gpu.memory_used_mb, gpu.memory_total_mb
            )
            .unwrap();
        }
        output
    }

    fn format_collections(&self, rows: &[CollectionRow]) -> String {
        if rows.is_empty() {
            return "No collections found.\n".to_string();
        }

        let mut output = String::new();
        writeln!(output, "Collections").unwrap();
        writeln!(output, "-----------").unwrap();
        for row in rows {
            match row.name {
                Some(ref name) => writeln!(output, "{} -> {}", name, row.collection).unwrap(),
                None => writeln!(output, "{}", row.collection).unwrap(),
            }
            writeln!(
                output,
                "  points {}, dim {}, model {}, complete {}",
                row.points,
                row.dimension,
                row.model.as_deref().unwrap_or("-"),
                yes_no(row.complete)
            )
            .unwrap();
        }
        output
    }

    fn format_collection_detail(&self, d: &CollectionDetail) -> String {
        let mut output = self.format_collections(std::slice::from_ref(&d.row));
        if let Some(ref task) = d.row.task {
            writeln!(output, "  task {}", task).unwrap();
        }
        if let Some(ref created) = d.created_at {
            writeln!(output, "  created {}", created).unwrap();
        }
        if let Some(ref finalized) = d.finalized_at {
            writeln!(output, "  finalized {}", finalized).unwrap();
        }
        if let Some(ref len) = d.text_length {
            writeln!(
                output,
                "  text length: min {} max {} avg {:.0} median {}",
                len.min, len.max, len.avg, len.median
            )
            .unwrap();
        }
        if !d.samples.is_empty() {
            writeln!(output, "\nSample records:").unwrap();
            for s in &d.samples {
                writeln!(output, "  [{}] {}", s.id, s.source).unwrap();
                writeln!(output, "    {}", s.preview).unwrap();
            }
        }
        output
    }

    fn format_search(&self, results: &SearchOutput) -> String {
        if results.hits.is_empty() {
            return format!("No results found for: {}\n", results.query);
        }

        let mut output = String::new();
        writeln!(
            output,
            "Results for \"{}\" in {}\n",
            results.query, results.collection
        )
        .unwrap();
        for hit in &results.hits {
            writeln!(output, "{}. {} [similarity {:.3}]", hit.rank, hit.id, hit.similarity).unwrap();
            writeln!(output, "   Source: {}", hit.source).unwrap();
            writeln!(output, "   {}", hit.preview).unwrap();
            writeln!(output).unwrap();
        }
        output
    }

    fn format_message(&self, message: &str) -> String {
        format!("{}\n", message)
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}\n", error)
    }
}

pub struct JsonFormatter {
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn render<T: Serialize + ?Sized>(&self, value: &T) -> String {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        rendered.unwrap_or_else(|e| serde_json::json!({"error": e.to_string()}).to_string())
    }
}

impl Formatter for JsonFormatter {
    fn format_run_summary(&self, summary: &RunSummary) -> String {
        self.render(summary)
    }

    fn format_run_counts(&self, counts: &RunCounts) -> String {
        self.render(&serde_json::json!({ "stopped": counts }))
    }

    fn format_validation(&self, report: &ValidationReport) -> String {
        self.render(report)
    }

    fn format_analysis(&self, report: &AnalysisReport, artifact: &Path) -> String {
        self.render(&serde_json::json!({
            "name": report.name,
            "collection": report.collection,
            "model": report.model_name,
            "dimension": report.dimension,
            "total_points": report.total_points,
            "sampled": report.assignments.len(),
            "clusters": report.clusters,
            "cluster_sizes": report.cluster_sizes,
            "outliers": report.outliers,
            "artifact": artifact.display().to_string(),
        }))
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        self.render(status)
    }

    fn format_collections(&self, rows: &[CollectionRow]) -> String {
        self.render(&serde_json::json!({ "collections": rows }))
    }

    fn format_collection_detail(&self, detail: &CollectionDetail) -> String {
        self.render(detail)
    }

    fn format_search(&self, results: &SearchOutput) -> String {
        self.render(results)
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({"message": message}).to_string()
    }

    fn format_error(&self, error: &str) -> String {
        serde_json::json!({"error": error}).to_string()
    }
}

pub struct MarkdownFormatter;

impl Formatter for MarkdownFormatter {
    fn format_run_counts(&self, c: &RunCounts) -> String {
        let mut output = String::new();
        writeln!(output, "## Embedding Stopped\n").unwrap();
        writeln!(output, "| Metric | Value |").unwrap();
        writeln!(output, "|--------|-------|").unwrap();
        writeln!(output, "| Total records | {} |", c.total_records).unwrap();
        writeln!(output, "| Processed | {} |", c.processed).unwrap();
        writeln!(output, "| Skipped | {} |", c.skipped.total()).unwrap();
        writeln!(output, "| Failed | {} |", c.failed).unwrap();
        writeln!(output, "| Checkpointed | {} |", c.checkpointed).unwrap();
        output
    }

    fn format_run_summary(&self, s: &RunSummary) -> String {
        let mut output = String::new();
        writeln!(output, "## Embedding Complete\n").unwrap();
        writeln!(output, "**Collection:** `{}` → `{}`\n", s.name, s.collection).unwrap();
        writeln!(output, "| Metric | Value |").unwrap();
        writeln!(output, "|--------|-------|").unwrap();
        writeln!(output, "| Model | {} |", s.model).unwrap();
        writeln!(output, "| Task | {} |", s.task).unwrap();
        writeln!(output, "| Total records | {} |", s.total_records).unwrap();
        writeln!(output, "| Processed | {} |", s.processed).unwrap();
        writeln!(output, "| Skipped (malformed) | {} |", s.skipped.malformed).unwrap();
        writeln!(output, "| Skipped (duplicate) | {} |", s.skipped.duplicate).unwrap();
        writeln!(
            output,
            "| Skipped (already processed) | {} |",
            s.skipped.already_processed
        )
        .unwrap();
        writeln!(output, "| Failed | {} |", s.failed).unwrap();
        writeln!(output, "| Truncated | {} |", s.truncated).unwrap();
        writeln!(output, "| Tokens | {} |", s.tokens).unwrap();
        writeln!(output, "| Elapsed | {:.1}s |", s.elapsed_secs).unwrap();
        writeln!(output, "| Docs/sec | {:.1} |", s.docs_per_sec).unwrap();
        writeln!(output, "| Tokens/sec | {:.0} |", s.tokens_per_sec).unwrap();
        writeln!(output, "| Final batch size | {} |", s.final_batch_size).unwrap();
        writeln!(output, "| In collection | {} |", s.documents_in_collection).unwrap();
        writeln!(output, "| Store | `{}` |", s.store_location).unwrap();
        output
    }

    fn format_validation(&self, r: &ValidationReport) -> String {
        let mut output = String::new();
        let mark = if r.passed { "✅" } else { "❌" };
        writeln!(output, "## Validation {}\n", mark).unwrap();
        writeln!(output, "**File:** `{}`\n", r.file_path).unwrap();
        writeln!(output, "| Metric | Value |").unwrap();
        writeln!(output, "|--------|-------|").unwrap();
        writeln!(output, "| Total lines | {} |", r.stats.total_lines).unwrap();
        writeln!(output, "| Valid documents | {} |", r.stats.valid_docs).unwrap();
        writeln!(output, "| Blank lines | {} |", r.stats.blank_lines).unwrap();
        writeln!(output, "| JSON errors | {} |", r.stats.json_errors).unwrap();
        writeln!(output, "| Invalid records | {} |", r.stats.invalid_records).unwrap();
        writeln!(output, "| Duplicate ids | {} |", r.stats.duplicate_ids).unwrap();
        if !r.errors.is_empty() {
            writeln!(output, "\n### Errors\n").unwrap();
            for e in r.errors.iter().take(10) {
                writeln!(output, "- {}", e).unwrap();
            }
        }
        if !r.warnings.is_empty() {
            writeln!(output, "\n### Warnings\n").unwrap();
            for w in r.warnings.iter().take(10) {
                writeln!(output, "- {}", w).unwrap();
            }
        }
        output
    }

    fn format_analysis(&self, r: &AnalysisReport, artifact: &Path) -> String {
        let mut output = String::new();
        writeln!(output, "## Analysis: `{}`\n", r.name).unwrap();
        writeln!(
            output,
            "- **Points:** {} of {}",
            r.assignments.len(),
            r.total_points
        )
        .unwrap();
        writeln!(output, "- **Outliers:** {}", r.outliers).unwrap();
        writeln!(output, "- **Artifact:** `{}`\n", artifact.display()).unwrap();
        writeln!(output, "| Cluster | Size |").unwrap();
        writeln!(output, "|---------|------|").unwrap();
        for (c, size) in r.cluster_sizes.iter().enumerate() {
            writeln!(output, "| {} | {} |", c, size).unwrap();
        }
        output
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        let mut output = String::new();
        writeln!(output, "## Status\n").unwrap();
        let embed = if status.embedding_ready { "✅" } else { "❌" };
        writeln!(
            output,
            "### Embedding ({}) {}\n",
            status.embedding_backend, embed
        )
        .unwrap();
        writeln!(output, "- **Model:** {}", status.embedding_model).unwrap();
        writeln!(output, "- **Target:** `{}`\n", status.embedding_target).unwrap();

        let store = if status.vector_store_connected {
            "✅"
        } else {
            "❌"
        };
        writeln!(
            output,
            "### Vector Store ({}) {}\n",
            status.vector_store_driver, store
        )
        .unwrap();
        writeln!(output, "- **Location:** `{}`", status.vector_store_location).unwrap();
        writeln!(output, "- **Collections:** {}\n", status.collections).unwrap();

        writeln!(output, "### Resources\n").unwrap();
        writeln!(output, "- {}", status.resources.short_summary()).unwrap();
        output
    }

    fn format_collections(&self, rows: &[CollectionRow]) -> String {
        if rows.is_empty() {
            return "## Collections\n\n*No collections found.*\n".to_string();
        }

        let mut output = String::new();
        writeln!(output, "## Collections\n").unwrap();
        writeln!(output, "| Name | Collection | Points | Dim | Model | Complete |").unwrap();
        writeln!(output, "|------|------------|--------|-----|-------|----------|").unwrap();
        for row in rows {
            writeln!(
                output,
                "| {} | `{}` | {} | {} | {} | {} |",
                row.name.as_deref().unwrap_or("-"),
                row.collection,
                row.points,
                row.dimension,
                row.model.as_deref().unwrap_or("-"),
                if row.complete { "✅" } else { "❌" }
            )
            .unwrap();
        }
        output
    }

    fn format_collection_detail(&self, d: &CollectionDetail) -> String {
        let mut output = self.format_collections(std::slice::from_ref(&d.row));
        if !d.samples.is_empty() {
            writeln!(output, "\n### Samples\n").unwrap();
            for s in &d.samples {
                writeln!(output, "- **{}** (`{}`): {}", s.id, s.source, s.preview).unwrap();
            }
        }
        output
    }

    fn format_search(&self, results: &SearchOutput) -> String {
        if results.hits.is_empty() {
            return format!("## No results found\n\nQuery: `{}`\n", results.query);
        }

        let mut output = String::new();
        writeln!(output, "## Search Results\n").unwrap();
        writeln!(output, "**Query:** `{}`\n", results.query).unwrap();
        for hit in &results.hits {
            writeln!(
                output,
                "### {}. `{}` ({:.3})\n",
                hit.rank, hit.id, hit.similarity
            )
            .unwrap();
            writeln!(output, "**Source:** `{}`\n", hit.source).unwrap();
            writeln!(output, "```").unwrap();
            writeln!(output, "{}", hit.preview).unwrap();
            writeln!(output, "```\n").unwrap();
        }
        output
    }

    fn format_message(&self, message: &str) -> String {
        format!("> {}\n", message)
    }

    fn format_error(&self, error: &str) -> String {
        format!("> ⚠️ **Error:** {}\n", error)
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Text => Box::new(TextFormatter),
        OutputFormat::Json => Box::new(JsonFormatter::new(true)),
        OutputFormat::Markdown => Box::new(MarkdownFormatter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: Option<&str>) -> CollectionRow {
        CollectionRow {
            name: name.map(String::from),
            collection: "docs__20260101000000".to_string(),
            points: 12,
            dimension: 8,
            model: Some("org/model".to_string()),
            task: Some("retrieval.passage".to_string()),
            complete: true,
        }
    }

    #[test]
    fn test_text_collections() {
        let out = TextFormatter.format_collections(&[row(Some("docs"))]);
        assert!(out.contains("docs -> docs__20260101000000"));
        assert!(out.contains("points 12, dim 8, model org/model, complete yes"));
        assert_eq!(TextFormatter.format_collections(&[]), "No collections found.\n");
    }

    #[test]
    fn test_json_collections_are_parseable() {
        let out = JsonFormatter::new(false).format_collections(&[row(None)]);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["collections"][0]["points"], 12);
        assert!(value["collections"][0]["name"].is_null());
    }

    #[test]
    fn test_markdown_collections_table() {
        let out = MarkdownFormatter.format_collections(&[row(Some("docs"))]);
        assert!(out.contains("| docs | `docs__20260101000000` | 12 | 8 | org/model | ✅ |"));
    }

    #[test]
    fn test_search_without_hits() {
        let results = SearchOutput {
            collection: "docs".into(),
            query: "rust".into(),
            hits: Vec::new(),
        };
        assert_eq!(TextFormatter.format_search(&results), "No results found for: rust\n");
    }

    #[test]
    fn test_stopped_run_reports_counts() {
        let counts = RunCounts {
            total_records: 10,
            processed: 4,
            skipped: crate::services::pipeline::SkipCounts {
                malformed: 1,
                duplicate: 0,
                already_processed: 2,
            },
            failed: 3,
            checkpointed: 6,
        };
        let text = TextFormatter.format_run_counts(&counts);
        assert!(text.contains("Processed:       4"));
        assert!(text.contains("Skipped:         3 (malformed 1, duplicate 0, already processed 2)"));
        assert!(text.contains("Failed:          3"));

        let json: serde_json::Value =
            serde_json::from_str(&JsonFormatter::new(false).format_run_counts(&counts)).unwrap();
        assert_eq!(json["stopped"]["failed"], 3);
        assert_eq!(json["stopped"]["skipped"]["already_processed"], 2);
    }
}
