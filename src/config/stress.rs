use anyhow::{ensure, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command, ValueEnum};
use csv::Writer;
use rand::distributions::{Uniform, WeightedIndex};
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use super::MemSampler;

/// The shared pointer under test.
#[derive(PartialEq, Eq, Debug, ValueEnum, Clone, Copy)]
pub enum PtrKind {
    /// `Handle` with the default teardown.
    Handle,
    /// `Handle` with a custom teardown function.
    HandleTeardown,
    /// `std::sync::Arc`, for comparison.
    Arc,
}

impl PtrKind {
    pub fn name(self) -> String {
        self.to_possible_value().unwrap().get_name().to_string()
    }
}

/// How many handles a single clone or release operation touches.
pub enum Burst {
    One,
    Four,
}

impl fmt::Display for Burst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Burst::One => write!(f, "1"),
            Burst::Four => write!(f, "4"),
        }
    }
}

#[derive(PartialEq, Debug)]
pub enum Op {
    Read,
    Clone,
    Release,
}

impl Op {
    pub const OPS: [Op; 3] = [Op::Read, Op::Clone, Op::Release];
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ReadRate {
    WriteOnly = 0,
    ReadWrite = 1,
    ReadIntensive = 2,
    ReadOnly = 3,
}

impl ReadRate {
    fn from_level(level: u8) -> Self {
        match level {
            0 => ReadRate::WriteOnly,
            1 => ReadRate::ReadWrite,
            2 => ReadRate::ReadIntensive,
            3 => ReadRate::ReadOnly,
            _ => unreachable!("read rate is invalid"),
        }
    }

    /// Weights of [`Op::OPS`].
    pub fn op_weights(self) -> [i32; 3] {
        match self {
            ReadRate::WriteOnly => [0, 1, 1],
            ReadRate::ReadWrite => [2, 1, 1],
            ReadRate::ReadIntensive => [18, 1, 1],
            ReadRate::ReadOnly => [1, 0, 0],
        }
    }
}

pub struct Config {
    pub kind: PtrKind,
    pub threads: usize,

    pub aux_thread: usize,
    pub aux_thread_period: Duration,
    pub sampling: bool,
    pub sampling_period: Duration,

    pub read_rate: ReadRate,
    pub op_dist: WeightedIndex<i32>,
    pub object_dist: Uniform<usize>,
    pub objects: usize,
    pub interval: u64,
    pub duration: Duration,
    pub burst: Burst,

    pub mem_sampler: MemSampler,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} threads, {} objects, g{}, c{}",
            self.kind.name(),
            self.threads,
            self.objects,
            self.read_rate as u8,
            self.burst,
        )
    }
}

#[derive(Clone, Debug)]
pub struct Perf {
    pub ops_per_sec: u64,
    pub peak_mem: usize,
    pub avg_mem: usize,
    /// Objects torn down once every handle was gone. Equals the number of objects.
    pub teardowns: usize,
}

impl fmt::Display for Perf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops/s: {}, peak mem: {}, avg_mem: {}, teardowns: {}",
            self.ops_per_sec,
            readable_bytes(self.peak_mem),
            readable_bytes(self.avg_mem),
            self.teardowns,
        )
    }
}

fn readable_bytes(num: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut exp = 0;
    while exp + 1 < UNITS.len() && num >> ((exp + 1) * 10) > 0 {
        exp += 1;
    }
    format!("{:.3} {}", num as f64 / (1u64 << (exp * 10)) as f64, UNITS[exp])
}

const HEADER: [&str; 9] = [
    "ptr",
    "threads",
    "objects",
    "read_rate",
    "burst",
    "throughput",
    "peak_mem",
    "avg_mem",
    "interval",
];

/// Appends one CSV record per run, if an output file was requested.
pub struct BenchWriter {
    output: Option<Writer<File>>,
}

impl BenchWriter {
    /// Opens `path` for appending, writing the header first if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        let output = match OpenOptions::new().append(true).open(path) {
            Ok(f) => Writer::from_writer(f),
            Err(_) => {
                let f = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                let mut output = Writer::from_writer(f);
                output.write_record(HEADER)?;
                output.flush()?;
                output
            }
        };
        Ok(Self {
            output: Some(output),
        })
    }

    pub fn none() -> Self {
        Self { output: None }
    }

    pub fn write_record(self, config: &Config, perf: &Perf) -> Result<()> {
        if let Some(mut output) = self.output {
            output.write_record(&[
                config.kind.name(),
                config.threads.to_string(),
                config.objects.to_string(),
                (config.read_rate as u8).to_string(),
                config.burst.to_string(),
                perf.ops_per_sec.to_string(),
                perf.peak_mem.to_string(),
                perf.avg_mem.to_string(),
                config.interval.to_string(),
            ])?;
            output.flush()?;
        }
        Ok(())
    }
}

pub fn command(name: &'static str) -> Command {
    Command::new(name)
        .arg(
            Arg::new("pointer")
                .short('m')
                .value_parser(value_parser!(PtrKind))
                .required(true)
                .ignore_case(true)
                .help("Shared pointer implementation"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .value_parser(value_parser!(usize))
                .required(true)
                .help("Numbers of threads to run."),
        )
        .arg(
            Arg::new("objects")
                .short('r')
                .value_parser(value_parser!(usize))
                .help("Number of shared objects the threads pick from")
                .default_value("64"),
        )
        .arg(
            Arg::new("read rate")
                .short('g')
                .help(
                    "The proportion of reads through a handle. \
                     0: 0%, 1: 50%, 2: 90%, 3: 100%",
                )
                .value_parser(value_parser!(u8).range(0..4))
                .default_value("1"),
        )
        .arg(
            Arg::new("burst")
                .short('c')
                .value_parser(["1", "4"])
                .help("Handles cloned or released per operation")
                .default_value("1"),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .value_parser(value_parser!(u64))
                .help("Time interval in seconds to run the benchmark")
                .default_value("10"),
        )
        .arg(
            Arg::new("sampling period")
                .short('s')
                .value_parser(value_parser!(u64))
                .help(
                    "The period to query jemalloc stats.allocated (ms). 0 for no sampling. \
                     Only supported on linux.",
                )
                .default_value("1"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .help("Output CSV filename. Appends the data if the file already exists."),
        )
        .arg(
            Arg::new("dry run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Check whether the arguments are parsable, without running a benchmark"),
        )
}

/// Builds the run configuration. Returns `None` on `--dry-run`.
pub fn from_matches(m: &ArgMatches) -> Result<Option<(Config, BenchWriter)>> {
    let kind = m.get_one::<PtrKind>("pointer").copied().unwrap();
    let threads = m.get_one::<usize>("threads").copied().unwrap();
    let objects = m.get_one::<usize>("objects").copied().unwrap();
    let read_rate = ReadRate::from_level(m.get_one::<u8>("read rate").copied().unwrap());
    let burst = match m.get_one::<String>("burst").unwrap().as_str() {
        "1" => Burst::One,
        "4" => Burst::Four,
        _ => unreachable!("burst should be one or four"),
    };
    let interval = m.get_one::<u64>("interval").copied().unwrap();
    ensure!(threads >= 1, "the number of threads must be greater than zero");
    ensure!(objects >= 1, "the number of objects must be greater than zero");
    let sampling_period = m.get_one::<u64>("sampling period").copied().unwrap();
    let sampling = sampling_period > 0 && cfg!(all(not(feature = "sanitize"), target_os = "linux"));

    if m.get_flag("dry run") {
        return Ok(None);
    }

    let output = match m.get_one::<String>("output") {
        Some(name) => BenchWriter::open(Path::new(name))?,
        None => BenchWriter::none(),
    };

    let config = Config {
        kind,
        threads,

        aux_thread: if sampling { 1 } else { 0 },
        aux_thread_period: Duration::from_millis(1),
        sampling,
        sampling_period: Duration::from_millis(sampling_period),

        read_rate,
        op_dist: WeightedIndex::new(read_rate.op_weights())?,
        object_dist: Uniform::from(0..objects),
        objects,
        interval,
        duration: Duration::from_secs(interval),
        burst,

        mem_sampler: MemSampler::new()?,
    };
    Ok(Some((config, output)))
}

pub fn setup(name: &'static str) -> Result<Option<(Config, BenchWriter)>> {
    from_matches(&command(name).get_matches())
}
