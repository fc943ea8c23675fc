//! The command-line front end: flag parsing, tool dispatch, and the build
//! entry point.

use crate::db::{self, InvocationLog, MemoryLog};
use crate::fs::RealFileSystem;
use crate::limited::LimitedRunner;
use crate::load;
use crate::paths::PathId;
use crate::pooled::PooledRunner;
use crate::progress::ConsoleProgress;
use crate::runner::{CommandRunner, DryRunRunner};
use crate::signal;
use crate::task::SubprocessRunner;
use crate::tools;
use crate::work::{self, BuildOptions, BuildOutcome, Work};
use anyhow::{anyhow, bail};

#[derive(argh::FromArgs)]
/// shk, a ninja compatible build executor
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=build.ninja]
    #[argh(option, short = 'f', default = "(\"build.ninja\".into())")]
    build_file: String,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// keep going until N failures (0 means infinity) [default=1]
    #[argh(option, short = 'k', default = "1")]
    keep_going: i64,

    /// do not start new jobs while the load average exceeds N
    #[argh(option, short = 'l', default = "0.0")]
    max_load_average: f64,

    /// dry run: act like every command succeeded without running any
    #[argh(switch, short = 'n')]
    dry_run: bool,

    /// print all command lines while building
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// run a subtool (use -t list to list subtools)
    #[argh(option, short = 't')]
    tool: Option<String>,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

fn default_parallelism() -> anyhow::Result<usize> {
    Ok(usize::from(std::thread::available_parallelism()?))
}

pub fn run() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let tool = opts.tool.as_deref();
    if let Some(name) = tool {
        if name == "list" {
            tools::list();
            return Ok(1);
        }
        if !tools::TOOLS.iter().any(|(known, _)| *known == name) {
            bail!("unknown tool {:?}, use -t list to list", name);
        }
    }

    signal::register();

    let mut state = load::read(&opts.build_file)?;

    match tool {
        Some("commands") => {
            tools::commands(&state, &opts.targets)?;
            return Ok(0);
        }
        Some("targets") => {
            tools::targets(&state)?;
            return Ok(0);
        }
        Some("query") => {
            tools::query(&state, &opts.targets)?;
            return Ok(0);
        }
        Some("compdb") => {
            tools::compdb(&state)?;
            return Ok(0);
        }
        _ => {}
    }

    let fs = RealFileSystem::new();
    let log_path = match &state.builddir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|err| anyhow!("mkdir {}: {}", dir, err))?;
            format!("{}/.shk_log", dir)
        }
        None => ".shk_log".to_owned(),
    };
    let mut parsed = db::parse(&fs, &mut state.paths, &log_path)?;
    if let Some(warning) = &parsed.warning {
        eprintln!("shk: warning: {}", warning);
    }

    match tool {
        Some("recompact") => {
            db::recompact(&fs, &state.paths, &parsed.invocations, &log_path)?;
            return Ok(0);
        }
        Some("deps") => {
            tools::deps(&state, &parsed.invocations, &opts.targets)?;
            return Ok(0);
        }
        Some("clean") => {
            let mut writer = db::Writer::open(&fs, &log_path, &parsed)?;
            tools::clean(&fs, &state, &parsed.invocations, &mut writer, &opts.targets)?;
            return Ok(0);
        }
        _ => {}
    }

    // A log dense with superseded records costs every startup; rewrite it
    // before this build appends more.
    if parsed.needs_recompaction && !opts.dry_run {
        db::recompact(&fs, &state.paths, &parsed.invocations, &log_path)?;
        parsed = db::parse(&fs, &mut state.paths, &log_path)?;
    }

    if state.graph.steps.is_empty() {
        println!("shk: no work to do");
        return Ok(0);
    }

    let want: Vec<PathId> = if opts.targets.is_empty() {
        let defaults = state.graph.default_targets();
        if defaults.is_empty() {
            bail!("no targets specified and the manifest has no default");
        }
        defaults
    } else {
        opts.targets
            .iter()
            .map(|name| state.paths.intern(name))
            .collect()
    };

    let options = BuildOptions {
        parallelism: match opts.parallelism {
            Some(parallelism) => parallelism,
            None => default_parallelism()?,
        },
        failures_allowed: if opts.keep_going <= 0 {
            usize::MAX
        } else {
            opts.keep_going as usize
        },
        max_load_average: opts.max_load_average,
        dry_run: opts.dry_run,
    };

    let mut log: Box<dyn InvocationLog> = if opts.dry_run {
        Box::new(MemoryLog::new())
    } else {
        Box::new(db::Writer::open(&fs, &log_path, &parsed)?)
    };
    let mut runner: Box<dyn CommandRunner> = if opts.dry_run {
        Box::new(PooledRunner::new(
            LimitedRunner::new(
                DryRunRunner::new(),
                options.parallelism,
                options.max_load_average,
            ),
            &state.pools,
        ))
    } else {
        Box::new(PooledRunner::new(
            LimitedRunner::new(
                SubprocessRunner::new(),
                options.parallelism,
                options.max_load_average,
            ),
            &state.pools,
        ))
    };
    let mut progress = ConsoleProgress::new(opts.verbose);

    let mut build = Work::new(
        &fs,
        &mut state.paths,
        &state.graph,
        &parsed.invocations,
        log.as_mut(),
        runner.as_mut(),
        &mut progress,
        &options,
        work::system_clock(),
    );
    for pid in want {
        build.want_path(pid)?;
    }
    match build.run()? {
        BuildOutcome::Finished { tasks_ran: 0 } => {
            println!("shk: no work to do");
            Ok(0)
        }
        BuildOutcome::Finished { tasks_ran } => {
            println!(
                "shk: ran {} task{}, now up to date",
                tasks_ran,
                if tasks_ran == 1 { "" } else { "s" }
            );
            Ok(0)
        }
        BuildOutcome::Failed => {
            // The failing command's output is enough information.
            Ok(1)
        }
        BuildOutcome::Interrupted => {
            eprintln!("shk: interrupted by user");
            Ok(2)
        }
    }
}
