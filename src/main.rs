//! Purpose: `mergekv` CLI entry point: ingest stdin records, then print merged groups.
//! Role: Binary crate root; parses args, drives one `Store` through open, ingest, group, close.
//! Invariants: stdout carries only merged records, one JSON object per line, in key order.
//! Invariants: Errors are emitted as a single JSON object on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Ingest runs producer/consumer over a bounded channel; the store has one writer.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use clap::{Parser, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value as JsonValue, json};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod ingest;

use ingest::{ErrorPolicy, InputFormat, ReaderConfig, read_records};
use mergekv::api::{
    Durability, Error, ErrorKind, Field, FieldKind, GroupBy, Record, Registry, SchemaDescriptor,
    Store, StoreLocation, StoreOptions, Value, record_to_json, to_exit_code,
};

/// Trailing key field that keeps records with equal user keys distinct.
const INDEX_FIELD: &str = "_i_";
const DEFAULT_QUEUE: usize = 100;

#[derive(Parser, Debug)]
#[command(
    name = "mergekv",
    version,
    about = "Group JSON records by a key prefix and aggregate each group",
    long_about = r#"Reads JSON records from stdin into an ordered store, then prints one
JSON object per distinct partial-key value with the requested aggregations.

Key fields (-k) are encoded in declaration order and all of them form the
partial key. Value fields (-v) are stored per record and feed aggregations.

Aggregation operators: first, first_not_null, min, max, sum, count,
count_distinct, tally."#,
    after_help = r#"EXAMPLES
  $ printf '{"k":1,"v":"a"}\n{"k":1,"v":"b"}\n{"k":2,"v":"c"}\n' \
      | mergekv -k k:int32 -v v:string -a 'seen:tally(v)'
  {"k":1,"seen":{"a":1,"b":1}}
  {"k":2,"seen":{"c":1}}

  $ mergekv --path ./store --no-ingest -a 'n:count(v)'"#
)]
struct Cli {
    #[arg(
        short = 'k',
        long = "key",
        value_name = "NAME:KIND",
        help = "Declare a key field (int8|int16|int32|int64|string|json); repeatable"
    )]
    keys: Vec<String>,
    #[arg(
        short = 'v',
        long = "value",
        value_name = "NAME:KIND",
        help = "Declare a value field; repeatable"
    )]
    values: Vec<String>,
    #[arg(
        short = 'a',
        long = "agg",
        value_name = "OUT:OP(FIELD)",
        help = "Aggregate a value field into OUT; `{}` may replace `()`"
    )]
    aggregations: Vec<String>,
    #[arg(short = 's', long, value_name = "NAME", help = "Storage backend: log|memory")]
    storage: Option<String>,
    #[arg(
        short = 'd',
        long,
        value_hint = ValueHint::DirPath,
        conflicts_with_all = ["memory", "path"],
        help = "Parent directory for a fresh temporary store (default: system temp dir)"
    )]
    dir: Option<PathBuf>,
    #[arg(long, conflicts_with = "path", help = "Keep the store in memory only")]
    memory: bool,
    #[arg(
        long,
        value_hint = ValueHint::DirPath,
        help = "Open or create the store at exactly this directory"
    )]
    path: Option<PathBuf>,
    #[arg(long, help = "Do not read stdin; merge what the store already holds")]
    no_ingest: bool,
    #[arg(long, help = "Remove the store directory after printing results")]
    destroy: bool,
    #[arg(
        short = 'i',
        long = "in",
        default_value = "auto",
        value_enum,
        help = "Input format: auto|jsonl|seq"
    )]
    input: InputArg,
    #[arg(
        short = 'e',
        long = "errors",
        default_value = "stop",
        value_enum,
        help = "Input error policy: stop|skip"
    )]
    errors: ErrorsArg,
    #[arg(long, default_value_t = DEFAULT_QUEUE, help = "Capacity of the ingest queue")]
    queue: usize,
    #[arg(long, default_value = "fast", value_enum, help = "Commit durability: fast|flush")]
    durability: DurabilityArg,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum InputArg {
    Auto,
    Jsonl,
    Seq,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ErrorsArg {
    Stop,
    Skip,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum DurabilityArg {
    Fast,
    Flush,
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                return Ok(0);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `mergekv --help`."));
            }
        },
    };
    if cli.queue == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("--queue must be at least 1"));
    }

    let aggregations = cli
        .aggregations
        .iter()
        .map(|spec| parse_aggregation(spec))
        .collect::<Result<Vec<_>, _>>()?;
    let location = store_location(&cli);
    let options = store_options(&cli, &location)?;

    let registry = Registry::with_builtins();
    let mut store = Store::open(location, &options, &registry)?;
    if let Some(dir) = store.location() {
        info!(path = %dir.display(), storage = store.storage_name(), "using store");
    }

    let outcome = merge_into_stdout(&mut store, &cli, &aggregations);
    let finished = if cli.destroy {
        store.destroy()
    } else {
        store.close()
    };
    outcome?;
    finished?;
    Ok(0)
}

fn merge_into_stdout(
    store: &mut Store,
    cli: &Cli,
    aggregations: &[(String, String)],
) -> Result<(), Error> {
    let partial_keys: Vec<String> = store
        .schema()
        .keys()
        .iter()
        .map(|field| field.name.clone())
        .filter(|name| name != INDEX_FIELD)
        .collect();
    // Reject bad aggregations before consuming stdin.
    grouping(store, &partial_keys, aggregations).merger()?;

    if !cli.no_ingest {
        let config = ReaderConfig {
            format: match cli.input {
                InputArg::Auto => InputFormat::Auto,
                InputArg::Jsonl => InputFormat::Jsonl,
                InputArg::Seq => InputFormat::Seq,
            },
            errors: match cli.errors {
                ErrorsArg::Stop => ErrorPolicy::Stop,
                ErrorsArg::Skip => ErrorPolicy::Skip,
            },
            ..ReaderConfig::default()
        };
        let indexed = store.schema().key_position(INDEX_FIELD).is_some();
        let written = ingest_stdin(store, config, cli.queue, indexed)?;
        debug!(written, "ingest finished");
    }

    let mut out = BufWriter::new(io::stdout().lock());
    let stats = grouping(store, &partial_keys, aggregations).for_each(|record| {
        serde_json::to_writer(&mut out, &record_to_json(&record))
            .map_err(|err| Error::new(ErrorKind::Io).with_source(err))?;
        out.write_all(b"\n").map_err(stdout_error)
    })?;
    out.flush().map_err(stdout_error)?;
    debug!(entries = stats.entries, groups = stats.groups, "merge emitted");
    Ok(())
}

fn store_location(cli: &Cli) -> StoreLocation {
    if cli.memory {
        StoreLocation::Memory
    } else if let Some(path) = &cli.path {
        StoreLocation::Path(path.clone())
    } else {
        StoreLocation::TempIn(cli.dir.clone().unwrap_or_else(std::env::temp_dir))
    }
}

fn store_options(cli: &Cli, location: &StoreLocation) -> Result<StoreOptions, Error> {
    let mut options = StoreOptions::new();
    options.storage = cli.storage.clone();
    options.durability = match cli.durability {
        DurabilityArg::Fast => Durability::Fast,
        DurabilityArg::Flush => Durability::Flush,
    };
    if cli.keys.is_empty() && cli.values.is_empty() && is_existing_store(location) {
        return Ok(options);
    }
    for spec in &cli.keys {
        options.keys.push(Field::parse(spec)?);
    }
    options.keys.push(Field::new(INDEX_FIELD, FieldKind::Int32));
    for spec in &cli.values {
        options.values.push(Field::parse(spec)?);
    }
    Ok(options)
}

fn is_existing_store(location: &StoreLocation) -> bool {
    match location {
        StoreLocation::Path(dir) => SchemaDescriptor::path_in(dir).exists(),
        _ => false,
    }
}

/// Splits `out:op(field)` into the output name and the aggregation expression.
fn parse_aggregation(spec: &str) -> Result<(String, String), Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("aggregation {spec:?} must look like out:op(field)"))
    };
    let (output, expr) = spec.split_once(':').ok_or_else(invalid)?;
    let output = output.trim();
    if output.is_empty() || expr.trim().is_empty() {
        return Err(invalid());
    }
    Ok((output.to_string(), expr.trim().to_string()))
}

fn grouping<'s>(
    store: &'s Store,
    partial_keys: &[String],
    aggregations: &[(String, String)],
) -> GroupBy<'s> {
    aggregations.iter().fold(
        store.group_by().partial_keys(partial_keys.iter().cloned()),
        |group, (output, expr)| group.aggregate(output.as_str(), expr.as_str()),
    )
}

fn ingest_stdin(
    store: &mut Store,
    config: ReaderConfig,
    queue: usize,
    indexed: bool,
) -> Result<u64, Error> {
    let (tx, rx) = mpsc::sync_channel::<Record>(queue);
    let producer = thread::spawn(move || {
        let stdin = io::stdin().lock();
        read_records(
            stdin,
            config,
            |ordinal, mut record| {
                if indexed {
                    let index = i32::try_from(ordinal).map_err(|_| {
                        Error::new(ErrorKind::Encoding)
                            .with_message("input has more records than the int32 index can hold")
                            .with_field(INDEX_FIELD)
                    })?;
                    record.insert(INDEX_FIELD.to_string(), Value::Int32(index));
                }
                tx.send(record).map_err(|_| {
                    Error::new(ErrorKind::Internal).with_message("ingest consumer stopped")
                })
            },
            |rejected| {
                warn!(
                    ordinal = rejected.ordinal,
                    line = ?rejected.line,
                    reason = ?rejected.reason,
                    snippet = %rejected.snippet,
                    "skipping input record"
                );
            },
        )
    });

    let consumed = store.receive(rx);
    let produced = producer.join().map_err(|_| {
        Error::new(ErrorKind::Internal).with_message("input reader thread panicked")
    })?;
    let written = consumed?;
    let outcome = produced?;
    if outcome.rejected > 0 {
        warn!(
            accepted = outcome.accepted,
            rejected = outcome.rejected,
            "input records were skipped"
        );
    }
    Ok(written)
}

fn stdout_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write results")
        .with_source(err)
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn emit_error(err: &Error) {
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_json(err: &Error) -> JsonValue {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(field) = err.field() {
        inner.insert("field".to_string(), json!(field));
    }
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(display_path(path)));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    json!({ "error": JsonValue::Object(inner) })
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::Schema => "schema error",
        ErrorKind::StorageOpen => "failed to open storage",
        ErrorKind::Encoding => "encoding error",
        ErrorKind::Write => "write failed",
        ErrorKind::Iteration => "iteration failed",
        ErrorKind::Callback => "result sink failed",
        ErrorKind::Busy => "store is busy",
        ErrorKind::Io => "i/o error",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, error_json, parse_aggregation, store_location, store_options};
    use clap::Parser;
    use mergekv::api::{Error, ErrorKind, FieldKind, StoreLocation};

    #[test]
    fn aggregation_spec_splits_on_first_colon() {
        assert_eq!(
            parse_aggregation("seen:tally(v)").expect("parse"),
            ("seen".to_string(), "tally(v)".to_string())
        );
        assert_eq!(
            parse_aggregation(" n : count{v} ").expect("parse"),
            ("n".to_string(), "count{v}".to_string())
        );
        for bad in ["tally(v)", ":sum(x)", "out:"] {
            let err = parse_aggregation(bad).expect_err("invalid");
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn fresh_store_gets_hidden_index_key_last() {
        let cli = Cli::parse_from(["mergekv", "-k", "a:int8", "-k", "b:string", "-v", "x:json"]);
        let location = store_location(&cli);
        assert!(matches!(location, StoreLocation::TempIn(_)));
        let options = store_options(&cli, &location).expect("options");
        let names: Vec<_> = options.keys.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "_i_"]);
        assert_eq!(options.keys[2].kind, FieldKind::Int32);
        assert_eq!(options.values[0].kind, FieldKind::Json);
    }

    #[test]
    fn location_flags_conflict() {
        assert!(Cli::try_parse_from(["mergekv", "--memory", "--path", "x"]).is_err());
        assert!(Cli::try_parse_from(["mergekv", "-d", "x", "--memory"]).is_err());
        let cli = Cli::parse_from(["mergekv", "--memory"]);
        assert_eq!(store_location(&cli), StoreLocation::Memory);
    }

    #[test]
    fn bad_field_spec_is_reported() {
        let cli = Cli::parse_from(["mergekv", "-k", "a:float"]);
        let err = store_options(&cli, &StoreLocation::Memory).expect_err("bad kind");
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[test]
    fn error_json_carries_field_and_causes() {
        let io = std::io::Error::other("disk gone");
        let err = Error::new(ErrorKind::Encoding)
            .with_message("too long")
            .with_field("body")
            .with_source(io);
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Encoding");
        assert_eq!(value["error"]["field"], "body");
        assert_eq!(value["error"]["causes"][0], "disk gone");
    }
}
