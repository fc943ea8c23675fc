//! Subtools (`-t NAME`): read-only queries over the loaded manifest and
//! invocation log, plus `clean`.

use crate::db::{InvocationLog, Invocations};
use crate::fs::FileSystem;
use crate::graph::StepId;
use crate::hash::Hash;
use crate::load::State;
use crate::paths::PathId;
use crate::progress::step_message;
use anyhow::bail;

pub const TOOLS: &[(&str, &str)] = &[
    ("clean", "remove built outputs and their log entries"),
    ("commands", "print the commands needed to build the targets"),
    ("compdb", "print a clang compilation database"),
    ("deps", "print dependencies recorded in the invocation log"),
    ("list", "list subtools"),
    ("query", "show producers and consumers of a path"),
    ("recompact", "rewrite the invocation log to its minimal form"),
    ("targets", "list root targets"),
];

pub fn list() {
    println!("subtools:");
    for (name, desc) in TOOLS {
        println!("  {:10} {}", name, desc);
    }
}

/// Map target names to the steps that would build them; empty names select
/// the manifest's defaults.
fn select_steps(state: &State, targets: &[String]) -> anyhow::Result<Vec<StepId>> {
    let target_paths: Vec<PathId> = if targets.is_empty() {
        state.graph.default_targets()
    } else {
        let mut pids = Vec::new();
        for name in targets {
            match state.paths.lookup(name) {
                Some(pid) => pids.push(pid),
                None => bail!("unknown target {:?}", name),
            }
        }
        pids
    };
    let mut wanted = Vec::new();
    for pid in target_paths {
        if let Some(step) = state.graph.producer(pid) {
            if !wanted.contains(&step) {
                wanted.push(step);
            }
        }
    }
    Ok(state.graph.topo_order(&state.paths, &wanted)?)
}

pub fn commands(state: &State, targets: &[String]) -> anyhow::Result<()> {
    for id in select_steps(state, targets)? {
        if let Some(command) = &state.graph.steps.get(id).command {
            println!("{}", command);
        }
    }
    Ok(())
}

pub fn targets(state: &State) -> anyhow::Result<()> {
    for pid in state.graph.root_outputs() {
        println!("{}", state.paths.name(pid));
    }
    Ok(())
}

pub fn query(state: &State, targets: &[String]) -> anyhow::Result<()> {
    let [name] = targets else {
        bail!("query expects exactly one path");
    };
    let Some(pid) = state.paths.lookup(name) else {
        bail!("unknown path {:?}", name);
    };
    println!("{}:", state.paths.name(pid));
    if let Some(producer) = state.graph.producer(pid) {
        println!("  output of: {}", step_message(state.graph.steps.get(producer)));
    }
    let consumers = state.graph.consumers(pid);
    if !consumers.is_empty() {
        println!("  input of:");
        for &consumer in consumers {
            println!("    {}", step_message(state.graph.steps.get(consumer)));
        }
    }
    Ok(())
}

pub fn compdb(state: &State) -> anyhow::Result<()> {
    let directory = std::env::current_dir()?;
    let directory = directory.to_string_lossy();
    println!("[");
    let mut first = true;
    for (_, step) in state.graph.steps.iter() {
        let Some(command) = &step.command else {
            continue;
        };
        if !first {
            println!(",");
        }
        first = false;
        let file = step
            .ins
            .first()
            .map(|&pid| state.paths.name(pid))
            .unwrap_or("");
        let output = step
            .outs
            .first()
            .map(|&pid| state.paths.name(pid))
            .unwrap_or("");
        print!(
            "  {{\"directory\": {:?}, \"command\": {:?}, \"file\": {:?}, \"output\": {:?}}}",
            directory, command, file, output
        );
    }
    if !first {
        println!();
    }
    println!("]");
    Ok(())
}

pub fn deps(state: &State, invocations: &Invocations, targets: &[String]) -> anyhow::Result<()> {
    for id in select_steps(state, targets)? {
        let step = state.graph.steps.get(id);
        let Some(entry) = invocations.entries.get(&step.identity) else {
            continue;
        };
        let name = step
            .outs
            .first()
            .map(|&pid| state.paths.name(pid))
            .unwrap_or("?");
        println!("{}: #deps {}", name, entry.inputs.len());
        for (pid, _) in &entry.inputs {
            println!("    {}", state.paths.name(*pid));
        }
    }
    Ok(())
}

/// Remove the outputs the log recorded for the selected steps (all steps
/// when no targets are named), then the directories the build created
/// (deepest first, only if empty), and erase the corresponding log entries.
/// Cleaning a target cleans everything below it too.
pub fn clean(
    fs: &dyn FileSystem,
    state: &State,
    invocations: &Invocations,
    log: &mut dyn InvocationLog,
    targets: &[String],
) -> anyhow::Result<()> {
    let selected: Vec<Hash> = if targets.is_empty() {
        invocations.entries.keys().copied().collect()
    } else {
        select_steps(state, targets)?
            .iter()
            .map(|&id| state.graph.steps.get(id).identity)
            .collect()
    };

    let mut removed_files = 0;
    for step in &selected {
        let Some(entry) = invocations.entries.get(step) else {
            continue;
        };
        for (pid, _) in &entry.outputs {
            match fs.remove_file(state.paths.name(*pid)) {
                Ok(()) => removed_files += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => bail!("unlink {}: {}", state.paths.name(*pid), err),
            }
        }
        log.cleaned_command(*step)?;
    }

    let mut dirs: Vec<PathId> = invocations.created_dirs.iter().copied().collect();
    // Children sort after parents; remove in reverse.
    dirs.sort_by(|&a, &b| state.paths.name(a).cmp(state.paths.name(b)));
    let mut removed_dirs = 0;
    for &dir in dirs.iter().rev() {
        if fs.remove_dir(state.paths.name(dir)).is_ok() {
            log.removed_directory(&state.paths, dir)?;
            removed_dirs += 1;
        }
    }

    println!(
        "shk: removed {} file{} and {} director{}",
        removed_files,
        if removed_files == 1 { "" } else { "s" },
        removed_dirs,
        if removed_dirs == 1 { "y" } else { "ies" }
    );
    Ok(())
}
