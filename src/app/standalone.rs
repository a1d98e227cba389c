use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::Parser;
use mrpool::standalone::{Args, Commands, Job};
use mrpool::*;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

struct Submission {
    job: Job,
    workload: String,
    output: PathBuf,
    args: Vec<String>,
}

fn parse_args() -> Result<(u8, Submission)> {
    let args = Args::parse();
    match args.command {
        Commands::Submit {
            input,
            workload,
            output,
            mappers,
            reducers,
            args: aux,
        } => {
            let mut job = Job::new(utils::input_files(&input)?).reducers(reducers);
            if let Some(mappers) = mappers {
                job = job.mappers(mappers);
            }
            Ok((
                args.verbose,
                Submission {
                    job,
                    workload,
                    output: PathBuf::from(output),
                    args: aux,
                },
            ))
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(verbose >= 2)
        .init();
}

fn open_outputs(dir: &Path, partitions: usize) -> Result<Vec<Mutex<BufWriter<File>>>> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    (0..partitions)
        .map(|p| {
            let path = dir.join(utils::output_name(p));
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Mutex::new(BufWriter::new(file)))
        })
        .collect()
}

fn run_standalone_mr_job(submission: Submission) -> Result<RunStats> {
    submission.job.validate()?;
    let engine = workload::named(&submission.workload)?;
    let serialized_args = Bytes::from(serde_json::to_string(&submission.args)?);
    let outputs = open_outputs(&submission.output, submission.job.num_reducers)?;
    debug!(job = ?submission.job, workload = %submission.workload, "starting job");

    let map_args = serialized_args.clone();
    let map = move |path: &Path, emitter: &Emitter| {
        if let Err(err) = (engine.map_fn)(path, emitter, &map_args) {
            error!(path = %path.display(), "map failed: {:#}", err);
        }
    };

    let reduce = |key: Bytes, values: &mut Cursor<'_>, partition: usize| {
        let out = match (engine.reduce_fn)(key.clone(), values, &serialized_args) {
            Ok(out) => out,
            Err(err) => {
                error!(partition, key = ?key, "reduce failed: {:#}", err);
                return;
            }
        };
        let mut writer = outputs[partition].lock().expect("output lock poisoned");
        if let Err(err) = writer.write_all(&out) {
            error!(partition, "failed to write output: {}", err);
        }
    };

    let stats = run_job(&submission.job, map, reduce)?;

    for (partition, writer) in outputs.into_iter().enumerate() {
        writer
            .into_inner()
            .map_err(|_| anyhow!("output lock poisoned"))?
            .flush()
            .with_context(|| format!("failed to flush output {}", partition))?;
    }
    Ok(stats)
}

fn main() -> Result<()> {
    let (verbose, submission) = parse_args()?;
    init_tracing(verbose);

    let output = submission.output.clone();
    let stats = run_standalone_mr_job(submission)?;
    info!(
        output = %output.display(),
        stats = %serde_json::to_string(&stats)?,
        "job complete"
    );
    Ok(())
}
