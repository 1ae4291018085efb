//! ringbatch CLI
//!
//! Batched io_uring file writes and reads from the command line.

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use config::Config;

/// ringbatch - batched io_uring file I/O
#[derive(Parser)]
#[command(name = "ringbatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a file into DEST with batched writes, each batch ending in fsync
    Write {
        /// Destination file (created if missing)
        #[arg(required = true)]
        dest: PathBuf,

        /// Source file whose contents are written
        #[arg(short, long)]
        input: PathBuf,

        /// Offset in DEST of the first byte
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Read a byte range of SRC with batched reads
    Read {
        /// File to read
        #[arg(required = true)]
        src: PathBuf,

        /// Offset of the first byte
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Number of bytes to read
        #[arg(short, long)]
        length: u64,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration, or write it out with --init
    Config {
        /// Write the configuration to the config path instead of printing it
        #[arg(long)]
        init: bool,

        /// Replace an existing file when used with --init
        #[arg(long, requires = "init")]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration; --init may target a file that does not exist yet
    let initializing = matches!(cli.command, Commands::Config { init: true, .. });
    let config = match &cli.config {
        Some(path) if initializing && !path.exists() => Config::default(),
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::load_or_default()?,
    };

    // Validate configuration
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Write {
            dest,
            input,
            offset,
        } => commands::write_file(&dest, &input, offset, &config),
        Commands::Read {
            src,
            offset,
            length,
            output,
        } => commands::read_range(&src, offset, length, output.as_deref(), &config),
        Commands::Config { init: true, force } => {
            let path = cli.config.unwrap_or_else(Config::default_path);
            config.write_to(&path, force)?;
            tracing::info!("Wrote configuration to {}", path.display());
            Ok(())
        }
        Commands::Config { init: false, .. } => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
mod commands {
    use crate::config::Config;
    use crate::progress::{BatchProgress, format_bytes, format_rate};
    use anyhow::Context;
    use ringbatch::uring::UringFacility;
    use ringbatch::{BatchExecutor, ReadRequest, WriteRequest};
    use std::fs::{File, OpenOptions};
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::path::Path;
    use std::time::Instant;

    fn file_offset(base: u64, delta: usize) -> anyhow::Result<i64> {
        let offset = base
            .checked_add(delta as u64)
            .context("offset overflows u64")?;
        i64::try_from(offset).context("offset exceeds the signed 64-bit range")
    }

    /// Copy `input` into `dest` starting at `offset`
    pub fn write_file(dest: &Path, input: &Path, offset: u64, config: &Config) -> anyhow::Result<()> {
        let data = std::fs::read(input)
            .with_context(|| format!("failed to read {}", input.display()))?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dest)
            .with_context(|| format!("failed to open {}", dest.display()))?;

        let block_size = config.io.block_size;
        let requests = data
            .chunks(block_size)
            .enumerate()
            .map(|(i, block)| -> anyhow::Result<WriteRequest<'_>> {
                Ok(WriteRequest::new(block, file_offset(offset, i * block_size)?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        tracing::info!(
            "Writing {} to {} in {} requests of up to {} entries per batch",
            format_bytes(data.len() as u64),
            dest.display(),
            requests.len(),
            config.batch.max_entries
        );

        let exec = BatchExecutor::new(UringFacility::new());
        let progress = BatchProgress::new(data.len() as u64, &format!("Writing {}", dest.display()));
        let started = Instant::now();

        let result = exec.write_chunked_with(
            &requests,
            file.as_fd(),
            &config.batch,
            |index, chunk, outcome| {
                let lengths: Vec<usize> = chunk.iter().map(WriteRequest::len).collect();
                let short = outcome.short_requests(&lengths);
                if !short.is_empty() {
                    tracing::warn!("Batch {} had {} short writes", index, short.len());
                }
                progress.advance(outcome.total());
            },
        );
        let written = match result {
            Ok(outcome) => outcome.total(),
            Err(e) => {
                progress.abandon();
                return Err(e).with_context(|| format!("failed to write {}", dest.display()));
            }
        };

        progress.finish_with_message(format!(
            "Wrote {} ({})",
            format_bytes(written),
            format_rate(written, started.elapsed())
        ));
        Ok(())
    }

    /// Read `length` bytes of `src` at `offset` to `output` or stdout
    pub fn read_range(
        src: &Path,
        offset: u64,
        length: u64,
        output: Option<&Path>,
        config: &Config,
    ) -> anyhow::Result<()> {
        let file = File::open(src).with_context(|| format!("failed to open {}", src.display()))?;
        let length = usize::try_from(length).context("length exceeds the address space")?;

        let block_size = config.io.block_size;
        let mut buffer = vec![0u8; length];
        let mut requests = buffer
            .chunks_mut(block_size)
            .enumerate()
            .map(|(i, block)| -> anyhow::Result<ReadRequest<'_>> {
                Ok(ReadRequest::new(block, file_offset(offset, i * block_size)?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let exec = BatchExecutor::new(UringFacility::new());
        let outcome = exec
            .read_chunked(&mut requests, file.as_fd(), &config.batch)
            .with_context(|| format!("failed to read {}", src.display()))?;
        drop(requests);

        tracing::info!(
            "Read {} of {} requested from {}",
            format_bytes(outcome.total()),
            format_bytes(length as u64),
            src.display()
        );

        let mut sink: Box<dyn Write> = match output {
            Some(path) => Box::new(
                File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
            ),
            None => Box::new(std::io::stdout().lock()),
        };
        for (block, &bytes) in buffer.chunks(block_size).zip(outcome.transferred()) {
            sink.write_all(&block[..bytes])?;
        }
        sink.flush()?;
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod commands {
    use crate::config::Config;
    use std::path::Path;

    pub fn write_file(_: &Path, _: &Path, _: u64, _: &Config) -> anyhow::Result<()> {
        anyhow::bail!("batched writes require Linux io_uring")
    }

    pub fn read_range(_: &Path, _: u64, _: u64, _: Option<&Path>, _: &Config) -> anyhow::Result<()> {
        anyhow::bail!("batched reads require Linux io_uring")
    }
}
