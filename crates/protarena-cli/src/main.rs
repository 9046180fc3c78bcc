//! protarena - Inspect, round-trip and merge Protocol Buffer messages
//!
//! Messages are interpreted with descriptors loaded at runtime from a
//! `FileDescriptorSet` (as produced by `protoc --descriptor_set_out`), so no
//! generated code is needed.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use protarena_core::{
    wire::{self, DecodeOptions},
    Arena, MessageType, Registry, MAX_DEPTH,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Inspect, round-trip and merge Protocol Buffer messages
#[derive(Parser, Debug)]
#[command(name = "protarena")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the top-level wire fields of a message without a schema
    Raw {
        /// Encoded message
        input: PathBuf,
    },
    /// Decode and re-encode messages, reporting whether the bytes survive
    Roundtrip {
        #[command(flatten)]
        schema: SchemaArgs,

        #[command(flatten)]
        input: InputMode,
    },
    /// Merge several encoded messages in order and write the result
    Merge {
        #[command(flatten)]
        schema: SchemaArgs,

        /// Output file for the merged message
        #[arg(short, long)]
        output: PathBuf,

        /// Overwrite the output file if it exists
        #[arg(long)]
        force: bool,

        /// Encoded messages, merged left to right
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Show the present fields of a message
    Inspect {
        #[command(flatten)]
        schema: SchemaArgs,

        /// Encoded message
        input: PathBuf,
    },
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Encoded FileDescriptorSet describing the message type
    #[arg(short, long)]
    descriptors: PathBuf,

    /// Fully qualified message type, e.g. `example.Person`
    #[arg(short = 't', long = "type")]
    message_type: String,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single encoded message
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory of encoded messages
    #[arg(short = 'D', long)]
    directory: Option<PathBuf>,
}

/// Outcome of one round trip
#[derive(Debug, Clone, PartialEq, Eq)]
struct RoundTrip {
    /// Canonical encoding equals the input
    identical: bool,
    /// Short digest of the canonical encoding
    digest: String,
    input_len: usize,
    output_len: usize,
}

#[derive(Debug, Default)]
struct RoundTripStats {
    identical: usize,
    changed: usize,
    failed: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    match cli.command {
        Command::Raw { input } => {
            let data = read_input(&input)?;
            for line in raw_listing(&data)? {
                println!("{}", line);
            }
            Ok(())
        }
        Command::Roundtrip { schema, input } => {
            let ty = load_type(&schema)?;
            if let Some(file) = input.file {
                roundtrip_file(&ty, &file)
            } else if let Some(directory) = input.directory {
                roundtrip_directory(&ty, &directory)
            } else {
                bail!("Either --file or --directory must be specified")
            }
        }
        Command::Merge {
            schema,
            output,
            force,
            inputs,
        } => {
            let ty = load_type(&schema)?;
            let merged = merge_files(&ty, &inputs)?;
            write_output(&output, &merged, force)?;
            println!("Wrote {} ({} bytes)", output.display(), merged.len());
            Ok(())
        }
        Command::Inspect { schema, input } => {
            let ty = load_type(&schema)?;
            let data = read_input(&input)?;
            for line in inspect(&ty, &data)? {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

/// Load the descriptor set and look up the requested message type
fn load_type(schema: &SchemaArgs) -> Result<MessageType> {
    let registry = Registry::from_file(&schema.descriptors).with_context(|| {
        format!(
            "Failed to load descriptors: {}",
            schema.descriptors.display()
        )
    })?;
    debug!(
        "Loaded {} message types from {}",
        registry.len(),
        schema.descriptors.display()
    );
    registry.message(&schema.message_type).with_context(|| {
        format!(
            "Message type '{}' not found in {}",
            schema.message_type,
            schema.descriptors.display()
        )
    })
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if !path.is_file() {
        bail!("Input path is not a file: {}", path.display());
    }
    trace!("Reading {}", path.display());
    fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))
}

/// One line per top-level field: number, wire type, offset and length
fn raw_listing(data: &[u8]) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for field in wire::raw_fields(data, MAX_DEPTH) {
        let field = field.context("Malformed wire data")?;
        lines.push(format!(
            "{:>9}  {:<10} @{:<8} {} bytes",
            field.number,
            format!("{:?}", field.wire_type),
            field.offset,
            field.len
        ));
    }
    Ok(lines)
}

/// Short hash of an encoding (first 8 hex chars of blake3)
fn digest(bytes: &[u8]) -> String {
    let hash = blake3::hash(bytes);
    hash.to_hex()[..8].to_string()
}

/// Decode `data` and encode it again
fn roundtrip(ty: &MessageType, data: &[u8]) -> Result<RoundTrip> {
    let mut arena = Arena::new();
    let msg = wire::decode(&mut arena, ty, data)?;
    let canonical = wire::encode(&arena, msg)?;
    let stats = arena.teardown();
    trace!(
        "Round trip used {} blocks, {} messages",
        stats.blocks,
        stats.messages
    );
    Ok(RoundTrip {
        identical: canonical == data,
        digest: digest(&canonical),
        input_len: data.len(),
        output_len: canonical.len(),
    })
}

fn report(path: &Path, outcome: &RoundTrip) {
    let status = if outcome.identical { "same" } else { "changed" };
    println!(
        "{:<8} {}  {} ({} -> {} bytes)",
        status,
        outcome.digest,
        path.display(),
        outcome.input_len,
        outcome.output_len
    );
}

fn roundtrip_file(ty: &MessageType, file: &Path) -> Result<()> {
    let data = read_input(file)?;
    let outcome = roundtrip(ty, &data)
        .with_context(|| format!("Failed to decode {} as {}", file.display(), ty))?;
    report(file, &outcome);
    Ok(())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Round-trip every file below `directory`
fn roundtrip_directory(ty: &MessageType, directory: &Path) -> Result<()> {
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!("Scanning directory: {}", directory.display());
    let mut stats = RoundTripStats::default();

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() || is_hidden(path) {
            continue;
        }

        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                warn!("Error reading {}: {}", path.display(), e);
                stats.failed += 1;
                continue;
            }
        };
        match roundtrip(ty, &data) {
            Ok(outcome) => {
                report(path, &outcome);
                if outcome.identical {
                    stats.identical += 1;
                } else {
                    stats.changed += 1;
                }
            }
            Err(e) => {
                // Log error but continue with other files
                warn!("Error decoding {}: {}", path.display(), e);
                stats.failed += 1;
            }
        }
    }

    info!(
        "Summary: {} unchanged, {} re-encoded differently, {} failed",
        stats.identical, stats.changed, stats.failed
    );
    Ok(())
}

/// Merge the messages in `inputs` left to right; returns the encoding
fn merge_files(ty: &MessageType, inputs: &[PathBuf]) -> Result<Vec<u8>> {
    let mut arena = Arena::new();
    let target = arena.new_message(ty)?;
    let options = DecodeOptions::default();

    for input in inputs {
        let data = read_input(input)?;
        wire::merge_from_bytes(&mut arena, target, &data, &options)
            .with_context(|| format!("Failed to merge {}", input.display()))?;
        debug!("Merged {} ({} bytes)", input.display(), data.len());
    }
    Ok(wire::encode(&arena, target)?)
}

/// Describe the present fields, unknown bytes and arena usage of a message
fn inspect(ty: &MessageType, data: &[u8]) -> Result<Vec<String>> {
    let mut arena = Arena::new();
    let msg = wire::decode(&mut arena, ty, data)?;
    let view = arena.view(msg)?;

    let mut lines = vec![format!("{} ({} bytes)", ty, data.len())];
    for field in view.present_fields() {
        let count = if field.is_repeated() {
            format!("[{}]", view.len(field.number())?)
        } else {
            String::new()
        };
        lines.push(format!(
            "{:>9}  {:<28} {:<8} {}",
            field.number(),
            field.name(),
            field.kind().name(),
            count
        ));
    }
    lines.push(format!("unknown: {} bytes", view.unknown_len()));
    lines.push(format!("initialized: {}", view.is_initialized()?));

    let stats = arena.stats();
    lines.push(format!(
        "arena: {} blocks, {} of {} bytes used, {} messages, {} arrays, {} maps",
        stats.blocks,
        stats.used_bytes,
        stats.reserved_bytes,
        stats.messages,
        stats.arrays,
        stats.maps
    ));
    Ok(lines)
}

/// Write the merged message, refusing to clobber without `force`
fn write_output(output_path: &Path, content: &[u8], force: bool) -> Result<()> {
    // Create parent directories
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    if output_path.exists() && !force {
        bail!(
            "File already exists: {} (use --force to overwrite)",
            output_path.display()
        );
    }

    let mut file = fs::File::create(output_path)
        .with_context(|| format!("Failed to create file: {}", output_path.display()))?;

    file.write_all(content)
        .with_context(|| format!("Failed to write file: {}", output_path.display()))?;

    Ok(())
}
