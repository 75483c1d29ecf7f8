//! Purpose: Decode stdin into records for ingestion, with explicit, testable input formats.
//! Exports: `InputFormat`, `ErrorPolicy`, `ReaderConfig`, `ReadOutcome`, `Rejected`, `RejectReason`, `read_records`.
//! Role: Producer side of the ingest pipeline; the CLI forwards each record into a bounded channel.
//! Invariants: Auto detection only inspects a bounded prefix and never loses bytes.
//! Invariants: Skip mode only resumes at record boundaries (newline or RS).
//! Invariants: Every record, accepted or rejected, consumes one ordinal so positions stay stable.
use std::io::{self, BufRead, BufReader, Read};

use bstr::ByteSlice;
use mergekv::api::{Error, ErrorKind, Record, record_from_json};
use serde_json::Value;

const RS: u8 = 0x1e;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InputFormat {
    Auto,
    Jsonl,
    Seq,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorPolicy {
    Stop,
    Skip,
}

#[derive(Copy, Clone, Debug)]
pub struct ReaderConfig {
    pub format: InputFormat,
    pub errors: ErrorPolicy,
    pub sniff_bytes: usize,
    pub max_record_bytes: usize,
    pub max_snippet_bytes: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            format: InputFormat::Auto,
            errors: ErrorPolicy::Stop,
            sniff_bytes: 8 * 1024,
            max_record_bytes: 4 * 1024 * 1024,
            max_snippet_bytes: 120,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadOutcome {
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RejectReason {
    Parse,
    Oversize,
    NotObject,
}

impl RejectReason {
    fn message(self) -> &'static str {
        match self {
            Self::Parse => "invalid json input",
            Self::Oversize => "record exceeds size limit",
            Self::NotObject => "record is not a JSON object",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Rejected {
    pub ordinal: u64,
    pub line: Option<u64>,
    pub reason: RejectReason,
    pub snippet: String,
}

/// Streams records from `reader`; `on_record` receives the zero-based ordinal and the record.
pub fn read_records<R, F, N>(
    reader: R,
    config: ReaderConfig,
    on_record: F,
    on_reject: N,
) -> Result<ReadOutcome, Error>
where
    R: Read,
    F: FnMut(u64, Record) -> Result<(), Error>,
    N: FnMut(Rejected),
{
    let mut sink = Sink {
        config,
        on_record,
        on_reject,
        outcome: ReadOutcome::default(),
        next: 0,
    };
    match config.format {
        InputFormat::Jsonl => read_jsonl(reader, false, &mut sink)?,
        InputFormat::Seq => read_seq(reader, &mut sink)?,
        InputFormat::Auto => {
            let (prefix, rest) = sniff(reader, config.sniff_bytes)?;
            let seq = prefix.contains(&RS);
            let stream = io::Cursor::new(prefix).chain(rest);
            if seq {
                read_seq(stream, &mut sink)?
            } else {
                read_jsonl(stream, true, &mut sink)?
            }
        }
    }
    Ok(sink.outcome)
}

struct Sink<F, N> {
    config: ReaderConfig,
    on_record: F,
    on_reject: N,
    outcome: ReadOutcome,
    next: u64,
}

impl<F, N> Sink<F, N>
where
    F: FnMut(u64, Record) -> Result<(), Error>,
    N: FnMut(Rejected),
{
    fn claim(&mut self) -> u64 {
        let ordinal = self.next;
        self.next += 1;
        ordinal
    }

    fn oversized(&self, len: usize) -> bool {
        len > self.config.max_record_bytes
    }

    fn parsed(&mut self, ordinal: u64, line: Option<u64>, value: Value, raw: &[u8]) -> Result<(), Error> {
        match record_from_json(value) {
            Ok(record) => {
                (self.on_record)(ordinal, record)?;
                self.outcome.accepted += 1;
                Ok(())
            }
            Err(_) => self.reject(ordinal, line, RejectReason::NotObject, raw),
        }
    }

    fn text(&mut self, line: Option<u64>, raw: &[u8]) -> Result<(), Error> {
        let ordinal = self.claim();
        if self.oversized(raw.len()) {
            return self.reject(ordinal, line, RejectReason::Oversize, raw);
        }
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => self.parsed(ordinal, line, value, raw),
            Err(_) => self.reject(ordinal, line, RejectReason::Parse, raw),
        }
    }

    fn reject(
        &mut self,
        ordinal: u64,
        line: Option<u64>,
        reason: RejectReason,
        raw: &[u8],
    ) -> Result<(), Error> {
        let snippet = snippet(raw, self.config.max_snippet_bytes);
        match self.config.errors {
            ErrorPolicy::Stop => {
                let position = match line {
                    Some(line) => format!("line {line}"),
                    None => format!("record {}", ordinal + 1),
                };
                let mut err = Error::new(ErrorKind::Usage)
                    .with_message(format!("{} at {position}: {snippet}", reason.message()));
                if reason == RejectReason::Parse {
                    err = err.with_hint("Use -e skip to continue or select the correct --in format.");
                }
                Err(err)
            }
            ErrorPolicy::Skip => {
                self.outcome.rejected += 1;
                (self.on_reject)(Rejected {
                    ordinal,
                    line,
                    reason,
                    snippet,
                });
                Ok(())
            }
        }
    }
}

fn sniff<R: Read>(reader: R, limit: usize) -> Result<(Vec<u8>, BufReader<R>), Error> {
    let mut reader = BufReader::new(reader);
    let mut prefix = Vec::new();
    while prefix.len() < limit {
        let available = reader.fill_buf().map_err(read_error)?;
        if available.is_empty() {
            break;
        }
        let take = available.len().min(limit - prefix.len());
        prefix.extend_from_slice(&available[..take]);
        reader.consume(take);
    }
    Ok((prefix, reader))
}

fn read_jsonl<R: Read, F, N>(reader: R, multiline: bool, sink: &mut Sink<F, N>) -> Result<(), Error>
where
    F: FnMut(u64, Record) -> Result<(), Error>,
    N: FnMut(Rejected),
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut line_no = 0u64;
    // Multi-line document being accumulated, with the line it started on.
    let mut pending: Option<(u64, Vec<u8>)> = None;
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(read_error)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        let trimmed = line.trim_end_with(|c| c == '\n' || c == '\r');

        if let Some((start, mut buf)) = pending.take() {
            if sink.config.errors == ErrorPolicy::Skip && starts_document(trimmed) {
                sink.text(Some(start), &buf)?;
            } else {
                buf.push(b'\n');
                buf.extend_from_slice(trimmed);
                if sink.oversized(buf.len()) {
                    sink.text(Some(start), &buf)?;
                } else if let Ok(value) = serde_json::from_slice::<Value>(&buf) {
                    let ordinal = sink.claim();
                    sink.parsed(ordinal, Some(start), value, &buf)?;
                } else {
                    pending = Some((start, buf));
                }
                continue;
            }
        }

        if trimmed.trim().is_empty() {
            continue;
        }
        if multiline
            && starts_document(trimmed)
            && !sink.oversized(trimmed.len())
            && serde_json::from_slice::<Value>(trimmed).is_err()
        {
            pending = Some((line_no, trimmed.to_vec()));
            continue;
        }
        sink.text(Some(line_no), trimmed)?;
    }
    if let Some((start, buf)) = pending {
        sink.text(Some(start), &buf)?;
    }
    Ok(())
}

fn read_seq<R: Read, F, N>(reader: R, sink: &mut Sink<F, N>) -> Result<(), Error>
where
    F: FnMut(u64, Record) -> Result<(), Error>,
    N: FnMut(Rejected),
{
    let mut reader = BufReader::new(reader);
    let mut record = Vec::new();
    loop {
        record.clear();
        let read = reader.read_until(RS, &mut record).map_err(read_error)?;
        if read == 0 {
            break;
        }
        if record.last() == Some(&RS) {
            record.pop();
        }
        if record.trim().is_empty() {
            continue;
        }
        sink.text(None, record.trim())?;
    }
    Ok(())
}

fn starts_document(line: &[u8]) -> bool {
    matches!(line.trim_start().first(), Some(b'{') | Some(b'['))
}

fn snippet(raw: &[u8], max: usize) -> String {
    let text = raw.to_str_lossy();
    if text.len() <= max {
        return text.into_owned();
    }
    let mut cut = max.saturating_sub(3);
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

fn read_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to read input")
        .with_source(err)
}
