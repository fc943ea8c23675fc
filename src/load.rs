//! Loads a manifest and produces the build graph, pools and defaults.

use crate::eval::{Env, EvalString};
use crate::graph::{Graph, Step};
use crate::parse::{Parser, Statement};
use crate::paths::{PathId, Paths};
use crate::smallmap::SmallMap;
use anyhow::{anyhow, bail};
use hashbrown::HashMap;
use std::borrow::Cow;

/// Everything the rest of the tool needs from the manifest.
pub struct State {
    pub paths: Paths,
    pub graph: Graph,
    pub pools: HashMap<String, u32>,
    /// Where the invocation log lives, when the manifest sets builddir.
    pub builddir: Option<String>,
}

/// The scope a rule's command and description are expanded in: the special
/// $in/$out bindings, then the build statement's own variables.
struct BuildScope<'a> {
    ins: String,
    outs: String,
    vars: &'a SmallMap<&'a str, String>,
}

impl<'a> Env for BuildScope<'a> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        match var {
            "in" => Some(Cow::Borrowed(&self.ins)),
            "out" => Some(Cow::Borrowed(&self.outs)),
            _ => self.vars.get(var).map(|val| Cow::Borrowed(val.as_str())),
        }
    }
}

pub fn read(build_file: &str) -> anyhow::Result<State> {
    let mut bytes = std::fs::read(build_file)
        .map_err(|err| anyhow!("read {}: {}", build_file, err))?;
    if bytes.last() != Some(&b'\n') {
        bytes.push(b'\n');
    }
    bytes.push(0);

    let mut parser = Parser::new(&bytes);
    let mut paths = Paths::new();
    let mut graph = Graph::new();
    let mut rules: HashMap<String, SmallMap<String, EvalString<String>>> = HashMap::new();
    let mut pools: HashMap<String, u32> = HashMap::new();
    let mut defaults: Vec<PathId> = Vec::new();

    loop {
        let stmt = match parser.read() {
            Ok(None) => break,
            Ok(Some(stmt)) => stmt,
            Err(err) => bail!("{}", parser.format_parse_error(build_file, err)),
        };
        match stmt {
            Statement::Rule(rule) => {
                if rule.name == "phony" || rules.contains_key(rule.name) {
                    bail!("{}: duplicate rule {:?}", build_file, rule.name);
                }
                let mut vars = SmallMap::default();
                for (name, val) in rule.vars.into_iter() {
                    vars.insert(name.to_owned(), val.into_owned());
                }
                rules.insert(rule.name.to_owned(), vars);
            }
            Statement::Pool(pool) => {
                if pools.contains_key(pool.name) {
                    bail!("{}: duplicate pool {:?}", build_file, pool.name);
                }
                pools.insert(pool.name.to_owned(), pool.depth);
            }
            Statement::Default(targets) => {
                for target in targets {
                    let name = target.evaluate(&[&parser.vars]);
                    defaults.push(paths.intern(&name));
                }
            }
            Statement::Build(build) => {
                // The statement's own bindings, evaluated against the
                // top-level scope.
                let mut build_vars: SmallMap<&str, String> = SmallMap::default();
                for (name, val) in build.vars.iter() {
                    build_vars.insert(*name, val.evaluate(&[&parser.vars]));
                }

                let out_names: Vec<String> = build
                    .outs
                    .iter()
                    .map(|path| path.evaluate(&[&build_vars, &parser.vars]))
                    .collect();
                let in_names: Vec<String> = build
                    .ins
                    .iter()
                    .map(|path| path.evaluate(&[&build_vars, &parser.vars]))
                    .collect();
                let outs: Vec<PathId> = out_names.iter().map(|name| paths.intern(name)).collect();
                let ins: Vec<PathId> = in_names.iter().map(|name| paths.intern(name)).collect();

                let scope = BuildScope {
                    ins: in_names[..build.explicit_ins].join(" "),
                    outs: out_names[..build.explicit_outs].join(" "),
                    vars: &build_vars,
                };
                let lookup = |var: &str| -> Option<String> {
                    if let Some(val) = build_vars.get(var) {
                        return Some(val.clone());
                    }
                    rules
                        .get(build.rule)?
                        .get(var)
                        .map(|val| val.evaluate(&[&scope, &parser.vars]))
                };

                let step = if build.rule == "phony" {
                    Step::new(&paths, None, None, String::new(), ins, outs, false, false)
                } else {
                    if !rules.contains_key(build.rule) {
                        bail!(
                            "{}:{}: unknown rule {:?}",
                            build_file,
                            build.line,
                            build.rule
                        );
                    }
                    let command = lookup("command").unwrap_or_default();
                    let description = lookup("description").filter(|desc| !desc.is_empty());
                    let pool = lookup("pool").unwrap_or_default();
                    if !pool.is_empty() && pool != "console" && !pools.contains_key(&pool) {
                        bail!("{}:{}: unknown pool {:?}", build_file, build.line, pool);
                    }
                    let generator = lookup("generator").is_some_and(|val| !val.is_empty());
                    let restat = lookup("restat").is_some_and(|val| !val.is_empty());
                    Step::new(
                        &paths,
                        Some(command),
                        description,
                        pool,
                        ins,
                        outs,
                        generator,
                        restat,
                    )
                };
                graph
                    .add_step(&paths, step)
                    .map_err(|err| anyhow!("{}:{}: {}", build_file, build.line, err))?;
            }
        }
    }

    graph.defaults = defaults;
    let builddir = parser.vars.get("builddir").cloned();
    Ok(State {
        paths,
        graph,
        pools,
        builddir,
    })
}
