//! Offline normalization of captured broker payloads.
//!
//! Reads a file with one broker payload per line (a JSON object or an array
//! of objects), runs every message through the same decoder and normalizer
//! the engine uses, and writes the resulting records as JSON lines. Useful
//! for checking a capture or a normalizer change without a broker.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use transit_sink::{RejectedEntry, RejectedRecordLog};
use transit_types::{decode_json_payload, Normalizer, SourcePosition};

use crate::ValidationOpts;

#[derive(Args, Debug, Clone)]
pub struct NormalizeArgs {
    /// File with one broker payload per line
    #[arg(long)]
    pub input: PathBuf,

    /// Where to write records (stdout when omitted)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Topic name recorded as the source of every record
    #[arg(long, default_value = "offline")]
    pub topic: String,

    /// Also write rejected messages to <dir>/rejected.jsonl
    #[arg(long)]
    pub rejected_dir: Option<PathBuf>,

    #[command(flatten)]
    pub validation: ValidationOpts,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NormalizeSummary {
    pub payloads: u64,
    pub records: u64,
    pub rejected: u64,
    pub payloads_rejected: u64,
    /// Records written with at least one data-quality issue
    pub flagged: u64,
}

pub async fn run_normalize(args: NormalizeArgs) -> anyhow::Result<NormalizeSummary> {
    let normalizer = Normalizer::new(args.validation.normalizer_config()?);
    let rejected_log = args.rejected_dir.map(RejectedRecordLog::new);

    let input = tokio::fs::File::open(&args.input)
        .await
        .with_context(|| format!("Failed to open {}", args.input.display()))?;
    let reader = BufReader::new(input);

    let summary = match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut writer = tokio::io::BufWriter::new(file);
            normalize_lines(reader, &mut writer, &normalizer, &args.topic, rejected_log.as_ref())
                .await?
        }
        None => {
            let mut stdout = tokio::io::stdout();
            normalize_lines(reader, &mut stdout, &normalizer, &args.topic, rejected_log.as_ref())
                .await?
        }
    };

    info!(
        payloads = summary.payloads,
        records = summary.records,
        rejected = summary.rejected,
        payloads_rejected = summary.payloads_rejected,
        flagged = summary.flagged,
        "Normalization finished"
    );
    Ok(summary)
}

/// Normalize every non-blank line of `reader`. The line number is used as
/// the offset, so record ids are stable across runs over the same file.
pub async fn normalize_lines<R, W>(
    reader: R,
    writer: &mut W,
    normalizer: &Normalizer,
    topic: &str,
    rejected_log: Option<&RejectedRecordLog>,
) -> anyhow::Result<NormalizeSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut summary = NormalizeSummary::default();
    let mut lines = reader.lines();
    let mut line_number: i64 = 0;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        summary.payloads += 1;
        let position = SourcePosition::new(topic, 0, line_number);

        let raws = match decode_json_payload(&position, line.as_bytes(), None) {
            Ok(raws) => raws,
            Err(e) => {
                summary.payloads_rejected += 1;
                summary.rejected += 1;
                warn!(line = line_number, "Rejected payload: {e}");
                if let Some(log) = rejected_log {
                    log.append(&RejectedEntry::from_payload(&position, &e)).await?;
                }
                continue;
            }
        };

        for raw in &raws {
            match normalizer.normalize(raw) {
                Ok(normalized) => {
                    if !normalized.quality.is_clean() {
                        summary.flagged += 1;
                    }
                    let mut row = serde_json::to_vec(&normalized.record)?;
                    row.push(b'\n');
                    writer.write_all(&row).await?;
                    summary.records += 1;
                }
                Err(e) => {
                    summary.rejected += 1;
                    warn!(line = line_number, index = raw.index, "Rejected record: {e}");
                    if let Some(log) = rejected_log {
                        log.append(&RejectedEntry::from_record(raw, &e)).await?;
                    }
                }
            }
        }
    }

    writer.flush().await?;
    Ok(summary)
}
