use clap::Parser;
use oj_judger::opt::{Opts, SubCmd};
use oj_judger::{config, executor, manager};
use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let (debug, workers, log_file) = match &opts.cmd {
        SubCmd::Manager(cmd) => (cmd.debug, cmd.workers, None),
        SubCmd::Executor(cmd) => (cmd.debug, cmd.workers, None),
        SubCmd::Validate(cmd) => (
            cmd.debug,
            1,
            Some(config::CONFIG.judgment_log_path(cmd.judgment_id)),
        ),
    };
    init_logging(debug, log_file)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        match opts.cmd {
            SubCmd::Manager(cmd) => manager::run(cmd).await,
            SubCmd::Executor(cmd) => executor::run(cmd).await,
            SubCmd::Validate(cmd) => executor::validate::run(cmd).await,
        }
    })
}

/// Everything logs to stderr; the validate subcommand additionally keeps a
/// per-judgment log file under `LOG_DIR`.
fn init_logging(debug: bool, log_file: Option<PathBuf>) -> anyhow::Result<()> {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                record.level(),
                record.target(),
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                message
            ))
        })
        .level(level)
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .level_for("sqlx", log::LevelFilter::Warn)
        .chain(std::io::stderr());

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}
