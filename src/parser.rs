//! Minimal textual CFG description parser.
//! One block per line:
//! ```text
//! fn euclid
//! entry: br loop done
//! loop:  jmp entry
//! done:  ret
//! ```
//! * `br t f` — conditional branch, true target then false target.
//! * `jmp t` — unconditional branch.
//! * `ret` — no successors.
//! * `switch t1 t2 ...` — parsed, but rejected when the graph is built.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::multispace1,
    combinator::map,
    multi::separated_list1,
    sequence::{preceded, tuple},
    IResult,
};

use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::{LiftError, Result};

/* --------------------------------- data --------------------------------- */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminatorAst {
    /// Two-way conditional: true target, false target.
    Br { on_true: String, on_false: String },
    Jmp(String),
    Ret,
    /// Multi-way branch. Never lifted; kept so the rejection happens with a
    /// proper error instead of a garbled parse.
    Switch(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionAst {
    pub name: String,
    /// Blocks in textual order; the first one is the entry block.
    pub blocks: Vec<(String, TerminatorAst)>,
}

/* ------------------------------ line shapes ------------------------------ */

lazy_static! {
    static ref RE_FN: Regex = Regex::new(r"^\s*fn\s+(?P<name>[A-Za-z_][\w.]*)\s*$").unwrap();
    static ref RE_BLOCK: Regex =
        Regex::new(r"^\s*(?P<block>[A-Za-z_][\w.]*)\s*:\s*(?P<term>\S.*?)\s*$").unwrap();
}

/* ----------------------------- nom primitives ----------------------------- */

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.')(input)
}

fn parse_br(input: &str) -> IResult<&str, TerminatorAst> {
    map(
        tuple((tag("br"), multispace1, ident, multispace1, ident)),
        |(_, _, t, _, f): (_, _, &str, _, &str)| TerminatorAst::Br {
            on_true: t.to_owned(),
            on_false: f.to_owned(),
        },
    )(input)
}

fn parse_jmp(input: &str) -> IResult<&str, TerminatorAst> {
    map(preceded(tuple((tag("jmp"), multispace1)), ident), |t: &str| {
        TerminatorAst::Jmp(t.to_owned())
    })(input)
}

fn parse_ret(input: &str) -> IResult<&str, TerminatorAst> {
    map(tag("ret"), |_| TerminatorAst::Ret)(input)
}

fn parse_switch(input: &str) -> IResult<&str, TerminatorAst> {
    map(
        preceded(
            tuple((tag("switch"), multispace1)),
            separated_list1(multispace1, ident),
        ),
        |targets: Vec<&str>| TerminatorAst::Switch(targets.iter().map(|s| s.to_string()).collect()),
    )(input)
}

fn parse_terminator(input: &str) -> Result<TerminatorAst> {
    // `switch` before `jmp`: both start with a bare word, alt tries in order.
    match alt((parse_br, parse_switch, parse_jmp, parse_ret))(input) {
        Ok((rest, term)) if rest.trim().is_empty() => Ok(term),
        Ok((rest, _)) => Err(LiftError::Parse(format!(
            "trailing input after terminator: `{}`",
            rest.trim()
        ))),
        Err(_) => Err(LiftError::Parse(format!("bad terminator: `{input}`"))),
    }
}

/* ------------------------------- whole text ------------------------------- */

fn is_comment(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('#') || t.starts_with(';') || t.starts_with("//")
}

/// Parse a whole CFG description. The function name defaults to `f` when no
/// `fn` line is present.
pub fn parse_cfg_text(input: &str) -> Result<FunctionAst> {
    let mut name = "f".to_string();
    let mut blocks = Vec::new();

    for line in input.lines() {
        if line.trim().is_empty() || is_comment(line) {
            continue;
        }
        if let Some(cap) = RE_FN.captures(line) {
            name = cap["name"].to_string();
            continue;
        }
        if let Some(cap) = RE_BLOCK.captures(line) {
            let block = cap["block"].to_string();
            let term = parse_terminator(&cap["term"])?;
            blocks.push((block, term));
            continue;
        }
        return Err(LiftError::Parse(format!("unrecognized line: `{}`", line.trim())));
    }

    if blocks.is_empty() {
        return Err(LiftError::Parse("no blocks in input".into()));
    }
    Ok(FunctionAst { name, blocks })
}
