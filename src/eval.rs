//! Parsed manifest strings with embedded `$var` references, and their
//! expansion to plain strings.

use crate::smallmap::SmallMap;
use std::borrow::Cow;
use std::collections::HashMap;

/// A source of variable values.  An EvalString is expanded against a chain
/// of these; the first env with a binding wins.
pub trait Env {
    fn get_var(&self, var: &str) -> Option<Cow<str>>;
}

/// One token of an unexpanded string: literal text or a variable reference.
#[derive(Debug, PartialEq)]
pub enum EvalPart<T: AsRef<str>> {
    Literal(T),
    VarRef(T),
}

/// An unexpanded string, e.g. `cc $in -o $out`.  Borrowed from the manifest
/// text while parsing; owned once stored in a rule.
#[derive(Debug, PartialEq)]
pub struct EvalString<T: AsRef<str>>(Vec<EvalPart<T>>);

impl<T: AsRef<str>> EvalString<T> {
    pub fn new(parts: Vec<EvalPart<T>>) -> Self {
        EvalString(parts)
    }

    pub fn evaluate(&self, envs: &[&dyn Env]) -> String {
        let mut out = String::new();
        for part in &self.0 {
            match part {
                EvalPart::Literal(text) => out.push_str(text.as_ref()),
                EvalPart::VarRef(var) => {
                    for env in envs {
                        if let Some(val) = env.get_var(var.as_ref()) {
                            out.push_str(&val);
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

impl EvalString<&str> {
    pub fn into_owned(self) -> EvalString<String> {
        EvalString(
            self.0
                .into_iter()
                .map(|part| match part {
                    EvalPart::Literal(text) => EvalPart::Literal(text.to_owned()),
                    EvalPart::VarRef(var) => EvalPart::VarRef(var.to_owned()),
                })
                .collect(),
        )
    }
}

/// Top-level variable bindings, evaluated eagerly as they are parsed.
#[derive(Debug, Default)]
pub struct Vars<'text>(HashMap<&'text str, String>);

impl<'text> Vars<'text> {
    pub fn insert(&mut self, key: &'text str, val: String) {
        self.0.insert(key, val);
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }
}

impl<'text> Env for Vars<'text> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.0.get(var).map(|val| Cow::Borrowed(val.as_str()))
    }
}

// The variables scoped to one build statement, already evaluated.
impl Env for SmallMap<&str, String> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.get(var).map(|val| Cow::Borrowed(val.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_walks_the_env_chain() {
        let mut outer = Vars::default();
        outer.insert("x", "outer".to_owned());
        outer.insert("y", "why".to_owned());
        let mut inner: SmallMap<&str, String> = SmallMap::default();
        inner.insert("x", "inner".to_owned());

        let s = EvalString::new(vec![
            EvalPart::VarRef("x"),
            EvalPart::Literal("-"),
            EvalPart::VarRef("y"),
            EvalPart::Literal("-"),
            EvalPart::VarRef("missing"),
        ]);
        assert_eq!(s.evaluate(&[&inner, &outer]), "inner-why-");
    }
}
