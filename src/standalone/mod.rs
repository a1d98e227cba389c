use crate::{partition, Partitioner};
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod engine;

/// Number of reduce partitions when none is given.
pub const DEFAULT_REDUCERS: usize = 10;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` wins if set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job on this machine
    Submit {
        /// Glob spec for the input files
        #[arg(short, long)]
        input: String,

        // Name of the workload
        #[arg(short, long)]
        workload: String,

        /// Output directory
        #[arg(short, long)]
        output: String,

        /// Number of map worker threads [default: available parallelism]
        #[arg(short, long)]
        mappers: Option<usize>,

        /// Number of reduce partitions, one reducer thread each
        #[arg(short, long, default_value_t = DEFAULT_REDUCERS)]
        reducers: usize,

        /// Auxiliary arguments to pass to the MapReduce application.
        #[clap(value_parser, last = true)]
        args: Vec<String>,
    },
}

/// Everything the engine needs to run besides the map and reduce functions.
#[derive(Clone)]
pub struct Job {
    pub files: Vec<PathBuf>,
    pub num_mappers: usize,
    pub num_reducers: usize,
    pub partitioner: Partitioner,
}

impl Job {
    /// A job over `files` with default thread counts and the DJB2 partitioner.
    pub fn new<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            num_mappers: default_mappers(),
            num_reducers: DEFAULT_REDUCERS,
            partitioner: partition,
        }
    }

    pub fn mappers(mut self, n: usize) -> Self {
        self.num_mappers = n;
        self
    }

    pub fn reducers(mut self, n: usize) -> Self {
        self.num_reducers = n;
        self
    }

    pub fn partitioner(mut self, partitioner: Partitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Checks the job can run at all. Nothing is spawned for a job that
    /// fails here.
    pub fn validate(&self) -> Result<()> {
        if self.files.is_empty() {
            bail!("no input files given");
        }
        if self.num_mappers == 0 {
            bail!("at least one mapper is required");
        }
        if self.num_reducers == 0 {
            bail!("at least one reducer is required");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("files", &self.files)
            .field("num_mappers", &self.num_mappers)
            .field("num_reducers", &self.num_reducers)
            .finish_non_exhaustive()
    }
}

fn default_mappers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
