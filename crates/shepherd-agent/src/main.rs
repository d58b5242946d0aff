//! shepherd-agent - log shipping agent.
//!
//! Tails one access log and streams every new line to the collector over a
//! reconnecting TCP connection. With `--generate` it instead appends
//! synthetic access-log lines to the file, for demos.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use shepherd_core::generator::{LogFileWriter, SampleLogGenerator};
use shepherd_core::tailer::{
    ChangeWaiter, FileTailer, MAX_LINES_PER_READ, StartPosition, TailerConfig,
};
use shepherd_core::transport::{
    CloseSummary, DEFAULT_SERVER, MAX_RECONNECT_DELAY, ReconnectPolicy, Transport,
    TransportConfig,
};

/// Log shipping agent.
#[derive(Parser, Debug)]
#[command(
    name = "shepherd-agent",
    about = "Tails a log file and ships new lines to the collector",
    version
)]
struct Args {
    /// Log file to tail (or to write to in --generate mode).
    #[arg(short = 'f', long, value_name = "PATH")]
    log_file: PathBuf,

    /// Collector ingest address.
    #[arg(short, long, default_value = DEFAULT_SERVER, env = "SHEPHERD_SERVER")]
    server: String,

    /// Ship the existing content of the file too, not only new lines.
    #[arg(long, conflicts_with = "start_offset")]
    from_start: bool,

    /// Resume from a byte offset reported by a previous run.
    #[arg(long, value_name = "BYTES")]
    start_offset: Option<u64>,

    /// Poll interval in milliseconds when file notifications are unavailable.
    #[arg(long, default_value = "500")]
    poll_interval_ms: u64,

    /// Delay before reconnecting to the collector, in seconds.
    #[arg(long, default_value = "3")]
    reconnect_secs: u64,

    /// Double the reconnect delay after every failure (capped at 60s).
    #[arg(long)]
    reconnect_backoff: bool,

    /// Lines kept in memory while the collector is unreachable.
    /// Oldest lines are dropped beyond this.
    #[arg(long, default_value = "10000")]
    buffer_lines: usize,

    /// Write sample access-log lines to the file instead of tailing it.
    #[arg(long)]
    generate: bool,

    /// Minimum pause between generated lines, in milliseconds.
    #[arg(long, default_value = "100")]
    generate_min_ms: u64,

    /// Maximum pause between generated lines, in milliseconds.
    #[arg(long, default_value = "2000")]
    generate_max_ms: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn tailer_config(&self) -> TailerConfig {
        let start = match (self.from_start, self.start_offset) {
            (_, Some(offset)) => StartPosition::Offset(offset),
            (true, None) => StartPosition::Beginning,
            (false, None) => StartPosition::End,
        };
        TailerConfig {
            path: self.log_file.clone(),
            start,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
        }
    }

    fn transport_config(&self) -> TransportConfig {
        let delay = Duration::from_secs(self.reconnect_secs);
        let reconnect = if self.reconnect_backoff {
            ReconnectPolicy::Exponential {
                initial: delay.max(Duration::from_secs(1)),
                max: MAX_RECONNECT_DELAY,
            }
        } else {
            ReconnectPolicy::Fixed(delay)
        };
        TransportConfig {
            server: self.server.clone(),
            reconnect,
            buffer_lines: self.buffer_lines,
            ..TransportConfig::default()
        }
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    for target in ["shepherd_agent", "shepherd_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Sleeps for `duration` in short slices so a shutdown signal is noticed.
fn sleep_while_running(duration: Duration, running: &AtomicBool) {
    let slice = Duration::from_millis(100);
    let mut remaining = duration;
    while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

/// Moves every complete line currently in the file into the transport and
/// tries to deliver. Returns the number of lines read.
fn pump(tailer: &mut FileTailer, transport: &mut Transport) -> usize {
    let mut read = 0;
    loop {
        match tailer.read_new_lines() {
            Ok(lines) => {
                let n = lines.len();
                read += n;
                for line in lines {
                    transport.enqueue(line);
                }
                if n < MAX_LINES_PER_READ {
                    break;
                }
            }
            Err(e) => {
                warn!("{}", e);
                break;
            }
        }
    }
    if read > 0 {
        debug!(lines = read, offset = tailer.offset(), "read new lines");
    }
    transport.flush();
    read
}

fn run_tail(args: &Args, running: &AtomicBool) -> ExitCode {
    let config = args.tailer_config();
    let mut tailer = match FileTailer::new(&config) {
        Ok(tailer) => tailer,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let waiter = ChangeWaiter::new(&config.path, config.poll_interval);
    let mut transport = Transport::new(args.transport_config());

    info!(
        "Tailing {} from offset {}, shipping to {}",
        config.path.display(),
        tailer.offset(),
        args.server
    );
    if !waiter.is_native() {
        info!("Polling every {}ms", config.poll_interval.as_millis());
    }

    let mut shipped: u64 = 0;
    while running.load(Ordering::SeqCst) {
        shipped += pump(&mut tailer, &mut transport) as u64;
        waiter.wait();
    }

    info!("Shutting down...");
    shipped += pump(&mut tailer, &mut transport) as u64;
    let summary = transport.close();
    let resume = resume_offset(&summary, &tailer);
    if summary.undelivered > 0 || summary.dropped > 0 {
        warn!(
            undelivered = summary.undelivered,
            dropped = summary.dropped,
            "some lines were not delivered"
        );
    }
    info!(
        lines = shipped,
        offset = resume,
        "agent stopped (resume with --start-offset {})",
        resume
    );
    ExitCode::SUCCESS
}

/// Offset a restarted agent should read from: the start of the first line
/// the collector never got, or the end of what was read.
fn resume_offset(summary: &CloseSummary, tailer: &FileTailer) -> u64 {
    summary.resume_offset.unwrap_or(tailer.offset())
}

fn run_generate(args: &Args, running: &AtomicBool) -> ExitCode {
    let mut writer = match LogFileWriter::open(&args.log_file, false) {
        Ok(writer) => writer,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut generator = SampleLogGenerator::new();
    let min = Duration::from_millis(args.generate_min_ms);
    let max = Duration::from_millis(args.generate_max_ms);

    info!(
        "Generating sample lines into {} every {}-{}ms",
        writer.path().display(),
        min.as_millis(),
        max.as_millis()
    );

    let mut written: u64 = 0;
    while running.load(Ordering::SeqCst) {
        let line = generator.next_line();
        if let Err(e) = writer.write_line(&line) {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
        written += 1;
        debug!(line = %line, "generated");
        sleep_while_running(generator.pause(min, max), running);
    }

    info!(lines = written, "generator stopped");
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("shepherd-agent {} starting", env!("CARGO_PKG_VERSION"));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    if args.generate {
        run_generate(&args, &running)
    } else {
        run_tail(&args, &running)
    }
}
