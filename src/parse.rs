//! Parser for the manifest subset shk consumes: variables, rules, build
//! statements with implicit and order-only inputs, pools, and defaults.
//! Depfiles, rsp files and dyndep have no place here; observed dependencies
//! come from the command tracer instead.

use crate::eval::{EvalPart, EvalString, Vars};
use crate::scanner::{ParseError, ParseResult, Scanner};
use crate::smallmap::SmallMap;

pub type VarList<'text> = SmallMap<&'text str, EvalString<&'text str>>;

pub struct Rule<'text> {
    pub name: &'text str,
    pub vars: VarList<'text>,
}

pub struct Build<'text> {
    pub rule: &'text str,
    pub line: usize,
    /// Explicit outputs first, implicit (`|`) after.
    pub outs: Vec<EvalString<&'text str>>,
    pub explicit_outs: usize,
    /// Explicit inputs, then implicit (`|`), then order-only (`||`).
    pub ins: Vec<EvalString<&'text str>>,
    pub explicit_ins: usize,
    pub vars: VarList<'text>,
}

#[derive(Debug)]
pub struct Pool<'text> {
    pub name: &'text str,
    pub depth: u32,
}

pub enum Statement<'text> {
    Rule(Rule<'text>),
    Build(Build<'text>),
    Default(Vec<EvalString<&'text str>>),
    Pool(Pool<'text>),
}

pub struct Parser<'text> {
    scanner: Scanner<'text>,
    /// Top-level bindings, evaluated as they are read.
    pub vars: Vars<'text>,
}

impl<'text> Parser<'text> {
    pub fn new(buf: &'text [u8]) -> Parser<'text> {
        Parser {
            scanner: Scanner::new(buf),
            vars: Vars::default(),
        }
    }

    pub fn format_parse_error(&self, filename: &str, err: ParseError) -> String {
        self.scanner.format_parse_error(filename, err)
    }

    pub fn read(&mut self) -> ParseResult<Option<Statement<'text>>> {
        loop {
            match self.scanner.peek() {
                '\0' => return Ok(None),
                '\n' => self.scanner.next(),
                '#' => self.skip_comment()?,
                ' ' | '\t' => return self.scanner.parse_error("unexpected whitespace"),
                _ => {
                    let ident = self.read_ident()?;
                    self.skip_spaces();
                    match ident {
                        "rule" => return Ok(Some(Statement::Rule(self.read_rule()?))),
                        "build" => return Ok(Some(Statement::Build(self.read_build()?))),
                        "default" => return Ok(Some(Statement::Default(self.read_default()?))),
                        "pool" => return Ok(Some(Statement::Pool(self.read_pool()?))),
                        "include" | "subninja" => {
                            return self
                                .scanner
                                .parse_error(format!("{} is not supported", ident));
                        }
                        ident => {
                            let val = self.read_vardef()?.evaluate(&[&self.vars]);
                            self.vars.insert(ident, val);
                        }
                    }
                }
            }
        }
    }

    /// The `= value` tail of a variable binding.
    fn read_vardef(&mut self) -> ParseResult<EvalString<&'text str>> {
        self.skip_spaces();
        self.scanner.expect('=')?;
        self.skip_spaces();
        if self.scanner.peek() == '\n' {
            self.scanner.next();
            return Ok(EvalString::new(Vec::new()));
        }
        let result = self.read_eval(false)?;
        self.scanner.expect('\n')?;
        Ok(result)
    }

    /// Indented `  name = value` lines under a rule, pool or build.
    fn read_scoped_vars(
        &mut self,
        validate: fn(var: &str) -> bool,
    ) -> ParseResult<VarList<'text>> {
        let mut vars = VarList::default();
        while self.scanner.peek() == ' ' {
            self.scanner.skip_spaces();
            let name = self.read_ident()?;
            if !validate(name) {
                return self
                    .scanner
                    .parse_error(format!("unexpected variable {:?}", name));
            }
            self.skip_spaces();
            let val = self.read_vardef()?;
            vars.insert(name, val);
        }
        Ok(vars)
    }

    fn read_rule(&mut self) -> ParseResult<Rule<'text>> {
        let name = self.read_ident()?;
        self.scanner.expect('\n')?;
        let vars = self.read_scoped_vars(|var| {
            matches!(
                var,
                "command" | "description" | "pool" | "restat" | "generator"
            )
        })?;
        if vars.get("command").is_none() {
            return self
                .scanner
                .parse_error(format!("rule {:?} has no command", name));
        }
        Ok(Rule { name, vars })
    }

    fn read_pool(&mut self) -> ParseResult<Pool<'text>> {
        let name = self.read_ident()?;
        self.scanner.expect('\n')?;
        let vars = self.read_scoped_vars(|var| var == "depth")?;
        let mut depth = 0;
        if let Some(val) = vars.get("depth") {
            let val = val.evaluate(&[&self.vars]);
            depth = match val.parse::<u32>() {
                Ok(depth) => depth,
                Err(err) => return self.scanner.parse_error(format!("pool depth: {}", err)),
            };
        }
        Ok(Pool { name, depth })
    }

    fn read_paths_to(&mut self, out: &mut Vec<EvalString<&'text str>>) -> ParseResult<()> {
        self.skip_spaces();
        while !matches!(self.scanner.peek(), ':' | '|' | '\n') {
            out.push(self.read_eval(true)?);
            self.skip_spaces();
        }
        Ok(())
    }

    fn read_build(&mut self) -> ParseResult<Build<'text>> {
        let line = self.scanner.line;
        let mut outs = Vec::new();
        self.read_paths_to(&mut outs)?;
        let explicit_outs = outs.len();
        if self.scanner.skip('|') {
            self.read_paths_to(&mut outs)?;
        }

        self.scanner.expect(':')?;
        self.skip_spaces();
        let rule = self.read_ident()?;

        let mut ins = Vec::new();
        self.read_paths_to(&mut ins)?;
        let explicit_ins = ins.len();

        // `|` implicit inputs, `||` order-only inputs; both participate in
        // scheduling, and dirtiness is decided by the log anyway.
        if self.scanner.skip('|') {
            if self.scanner.skip('|') {
                self.read_paths_to(&mut ins)?;
            } else {
                self.read_paths_to(&mut ins)?;
                if self.scanner.skip('|') {
                    self.scanner.expect('|')?;
                    self.read_paths_to(&mut ins)?;
                }
            }
        }

        self.scanner.expect('\n')?;
        let vars = self.read_scoped_vars(|_| true)?;
        Ok(Build {
            rule,
            line,
            outs,
            explicit_outs,
            ins,
            explicit_ins,
            vars,
        })
    }

    fn read_default(&mut self) -> ParseResult<Vec<EvalString<&'text str>>> {
        let mut defaults = Vec::new();
        self.read_paths_to(&mut defaults)?;
        if defaults.is_empty() {
            return self.scanner.parse_error("expected a path");
        }
        self.scanner.expect('\n')?;
        Ok(defaults)
    }

    fn skip_comment(&mut self) -> ParseResult<()> {
        loop {
            match self.scanner.read() {
                '\0' => {
                    self.scanner.back();
                    return Ok(());
                }
                '\n' => return Ok(()),
                _ => {}
            }
        }
    }

    /// Rule, pool and variable names.
    fn read_ident(&mut self) -> ParseResult<&'text str> {
        let start = self.scanner.ofs;
        while matches!(
            self.scanner.read(),
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.'
        ) {}
        self.scanner.back();
        let end = self.scanner.ofs;
        if end == start {
            return self.scanner.parse_error("expected an identifier");
        }
        Ok(self.scanner.slice(start, end))
    }

    /// Read until newline, or additionally space/colon/pipe in path mode,
    /// splitting out `$` escapes and variable references.
    fn read_eval(&mut self, path_mode: bool) -> ParseResult<EvalString<&'text str>> {
        let mut parts = Vec::new();
        let mut literal_start = self.scanner.ofs;
        loop {
            match self.scanner.read() {
                '\0' => return self.scanner.parse_error("unexpected end of file"),
                '\n' => {
                    self.scanner.back();
                    break;
                }
                ' ' | ':' | '|' if path_mode => {
                    self.scanner.back();
                    break;
                }
                '$' => {
                    let end = self.scanner.ofs - 1;
                    if end > literal_start {
                        parts.push(EvalPart::Literal(self.scanner.slice(literal_start, end)));
                    }
                    parts.push(self.read_escape()?);
                    literal_start = self.scanner.ofs;
                }
                _ => {}
            }
        }
        if self.scanner.ofs > literal_start {
            parts.push(EvalPart::Literal(
                self.scanner.slice(literal_start, self.scanner.ofs),
            ));
        }
        if parts.is_empty() {
            return self.scanner.parse_error("expected a string");
        }
        Ok(EvalString::new(parts))
    }

    /// The text following a `$`.
    fn read_escape(&mut self) -> ParseResult<EvalPart<&'text str>> {
        Ok(match self.scanner.read() {
            // Line continuation: swallow the newline and the indent.
            '\n' => {
                self.scanner.skip_spaces();
                EvalPart::Literal(self.scanner.slice(0, 0))
            }
            ' ' | '$' | ':' => {
                EvalPart::Literal(self.scanner.slice(self.scanner.ofs - 1, self.scanner.ofs))
            }
            '{' => {
                let start = self.scanner.ofs;
                loop {
                    match self.scanner.read() {
                        '\0' => return self.scanner.parse_error("unexpected end of file"),
                        '}' => break,
                        _ => {}
                    }
                }
                EvalPart::VarRef(self.scanner.slice(start, self.scanner.ofs - 1))
            }
            _ => {
                self.scanner.back();
                let start = self.scanner.ofs;
                while matches!(
                    self.scanner.read(),
                    'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-'
                ) {}
                self.scanner.back();
                if self.scanner.ofs == start {
                    return self.scanner.parse_error("expected a variable name");
                }
                EvalPart::VarRef(self.scanner.slice(start, self.scanner.ofs))
            }
        })
    }

    /// Skip spaces and `$`-newline line continuations.
    fn skip_spaces(&mut self) {
        loop {
            match self.scanner.read() {
                ' ' => {}
                '$' => {
                    if self.scanner.peek() != '\n' {
                        self.scanner.back();
                        return;
                    }
                    self.scanner.next();
                }
                _ => {
                    self.scanner.back();
                    return;
                }
            }
        }
    }
}
