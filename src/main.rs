use clap::{ArgAction, Args, Parser, Subcommand};
use log::{LevelFilter, Metadata, Record, error, info, warn};
use prettytable::{Table, row};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use thiserror::Error;

use kcore::{
    AllocStats, BlockDevice, CacheStats, DeviceError, FileDisk, Kernel, KernelError, MemDisk,
    ParamError, Params,
};

/// Device id every workload reads and writes
const WORKLOAD_DEV: u32 = 1;

/// Largest number of frames a core holds at once in the allocator workload
const MAX_BATCH: u64 = 8;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("{threads} threads can hold more buffers than the {nbuf} in the pool")]
    TooManyThreads { threads: usize, nbuf: usize },

    #[error("Worker {0} panicked")]
    WorkerPanicked(usize),

    #[error("{actual} frames free after the run, expected {expected}")]
    LostFrames { expected: usize, actual: usize },

    #[error("Cannot encode report: {0}")]
    Report(#[from] serde_json::Error),
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "kcore", about = "Drive the buffer cache and frame allocator")]
struct Cli {
    /// Log more; repeat for debug and trace output
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// JSON parameter file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Back the cache with this image file instead of memory
    #[arg(long)]
    image: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Hammer the buffer cache from several cores
    Bcache(Workload),
    /// Hammer the frame allocator from several cores
    Kalloc(Workload),
    /// Run both workloads at the same time
    All(Workload),
}

impl Command {
    fn workload(&self) -> Workload {
        match self {
            Command::Bcache(w) | Command::Kalloc(w) | Command::All(w) => *w,
        }
    }
}

#[derive(Args, Clone, Copy)]
struct Workload {
    /// Number of worker threads, each bound to core `index % ncpu`
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Operations per thread
    #[arg(long, default_value_t = 1000)]
    ops: usize,

    /// Distinct block numbers the cache workload touches
    #[arg(long, default_value_t = 64)]
    blocks: u32,
}

#[derive(Serialize)]
struct Report {
    params: Params,
    cache: CacheStats,
    alloc: AllocStats,
    free_frames: Vec<usize>,
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Xorshift step; workers only need a cheap spread of block numbers
fn next_rand(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn open_device(image: Option<&PathBuf>, block_size: usize) -> CliResult<Arc<dyn BlockDevice>> {
    let device: Arc<dyn BlockDevice> = match image {
        Some(path) => {
            if !path.exists() {
                FileDisk::create_image(path)?;
            }
            let mut disk = FileDisk::new(block_size);
            disk.attach(WORKLOAD_DEV, path)?;
            info!("using image {}", path.display());
            Arc::new(disk)
        }
        None => Arc::new(MemDisk::new(block_size)),
    };
    Ok(device)
}

/// Each worker reads random blocks, rewriting every fourth one with its
/// own tag and committing it.
fn run_bcache(kernel: &Kernel, workload: Workload) -> CliResult<()> {
    let nbuf = kernel.bcache.nbuf();
    if workload.threads > nbuf {
        return Err(CliError::TooManyThreads {
            threads: workload.threads,
            nbuf,
        });
    }

    let blocks = u64::from(workload.blocks.max(1));
    thread::scope(|s| -> CliResult<()> {
        let handles: Vec<_> = (0..workload.threads)
            .map(|worker| {
                s.spawn(move || -> CliResult<()> {
                    let mut rng = 0x9e37_79b9_7f4a_7c15 ^ (worker as u64 + 1);
                    for op in 0..workload.ops {
                        let blockno = (next_rand(&mut rng) % blocks) as u32;
                        let mut buf = kernel.bcache.acquire(WORKLOAD_DEV, blockno)?;
                        if op % 4 == 0 {
                            buf[0] = worker as u8;
                            kernel.bcache.commit(&buf)?;
                        }
                        kernel.bcache.release(buf);
                    }
                    Ok(())
                })
            })
            .collect();

        for (worker, handle) in handles.into_iter().enumerate() {
            handle.join().map_err(|_| CliError::WorkerPanicked(worker))??;
        }
        Ok(())
    })
}

/// Each worker takes a small batch of frames, scribbles on them and gives
/// them back on the same core.
fn run_kalloc(kernel: &Kernel, workload: Workload) -> CliResult<()> {
    let ncpu = kernel.kmem.ncpu();
    thread::scope(|s| -> CliResult<()> {
        let handles: Vec<_> = (0..workload.threads)
            .map(|worker| {
                s.spawn(move || {
                    let cpu = worker % ncpu;
                    let mut rng = 0xd1b5_4a32_d192_ed03 ^ (worker as u64 + 1);
                    let mut held = Vec::new();
                    let mut dry = 0;
                    for _ in 0..workload.ops {
                        let batch = next_rand(&mut rng) % MAX_BATCH + 1;
                        for _ in 0..batch {
                            match kernel.kmem.obtain(cpu) {
                                Some(frame) => held.push(frame),
                                None => dry += 1,
                            }
                        }
                        for frame in held.drain(..) {
                            if let Some(mut page) = kernel.kmem.memory().page(frame) {
                                page[0] = cpu as u8;
                            }
                            kernel.kmem.release(cpu, frame);
                        }
                    }
                    if dry > 0 {
                        warn!("worker {worker} on cpu {cpu}: {dry} allocations found no frame");
                    }
                })
            })
            .collect();

        for (worker, handle) in handles.into_iter().enumerate() {
            handle.join().map_err(|_| CliError::WorkerPanicked(worker))?;
        }
        Ok(())
    })
}

fn report(kernel: &Kernel, json: bool) -> CliResult<()> {
    let free_frames: Vec<usize> = (0..kernel.kmem.ncpu())
        .map(|cpu| kernel.kmem.free_count(cpu))
        .collect();

    if json {
        let report = Report {
            params: kernel.params().clone(),
            cache: kernel.bcache.stats(),
            alloc: kernel.kmem.stats(),
            free_frames,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let mut cpus = Table::new();
    cpus.add_row(row!["cpu", "free frames"]);
    for (cpu, free) in free_frames.iter().enumerate() {
        cpus.add_row(row![cpu, free]);
    }
    cpus.printstd();

    let cache = kernel.bcache.stats();
    let alloc = kernel.kmem.stats();
    let mut stats = Table::new();
    stats.add_row(row!["counter", "value"]);
    stats.add_row(row!["cache hits", cache.hits]);
    stats.add_row(row!["cache misses", cache.misses]);
    stats.add_row(row!["  same-bucket reuse", cache.local_reuse]);
    stats.add_row(row!["  first use", cache.first_use]);
    stats.add_row(row!["  relocations", cache.relocations]);
    stats.add_row(row!["device reads", cache.device_reads]);
    stats.add_row(row!["device writes", cache.device_writes]);
    stats.add_row(row!["steals", alloc.steals]);
    stats.add_row(row!["failed steals", alloc.failed_steals]);
    stats.printstd();

    Ok(())
}

fn run(cli: Cli) -> CliResult<()> {
    let params = match &cli.config {
        Some(path) => Params::load(path)?,
        None => Params::default(),
    };
    let device = open_device(cli.image.as_ref(), params.block_size)?;
    let kernel = Kernel::new(params, device)?;
    let workload = cli.command.workload();

    match cli.command {
        Command::Bcache(_) => run_bcache(&kernel, workload)?,
        Command::Kalloc(_) => run_kalloc(&kernel, workload)?,
        Command::All(_) => {
            let (bcache, kalloc) = thread::scope(|s| {
                let bcache = s.spawn(|| run_bcache(&kernel, workload));
                let kalloc = run_kalloc(&kernel, workload);
                (bcache.join(), kalloc)
            });
            bcache.map_err(|_| CliError::WorkerPanicked(0))??;
            kalloc?;
        }
    }

    kernel.kmem.check_lengths();
    let expected = kernel.kmem.memory().page_count();
    let actual = kernel.kmem.total_free();
    if actual != expected {
        return Err(CliError::LostFrames { expected, actual });
    }

    report(&kernel, cli.json)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("kcore: {e}");
            ExitCode::FAILURE
        }
    }
}
