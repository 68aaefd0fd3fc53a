//! The native template engine.
//!
//! Syntax is a compact expression language inside `{{ ... }}` tags:
//!
//! ```text
//! machine github.com
//!   login {{ env "GH_USER" }}
//!   password {{ envDefault "GH_TOKEN" "anonymous" }}
//! {{ if env "EXTRA" }}  extra {{ env "EXTRA" | upper }}{{ end }}
//! {{ range split "," (env "HOSTS") }}host {{ . }}
//! {{ end }}
//! ```
//!
//! A tag holds a pipeline: a leading term (literal, `.`, parenthesized
//! pipeline, or function call) followed by `|`-separated function stages.
//! The piped value is appended as the *last* argument of each stage.
//! `if`/`else`/`end` and `range`/`end` blocks nest.
//!
//! The engine is deliberately independent of where values come from: the
//! four domain builtins (`env`, `envDefault`, `file`, `exec`) are supplied
//! through the [`Builtins`] trait; everything else is a pure string/list
//! helper.

use std::collections::HashSet;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TemplateError(pub String);

fn err<T>(message: impl Into<String>) -> Result<T, TemplateError> {
    Err(TemplateError(message.into()))
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Str(s) => !s.is_empty(),
            Value::Int(n) => *n != 0,
            Value::Bool(b) => *b,
            Value::List(items) => !items.is_empty(),
        }
    }

    /// The "empty" notion used by `default`: zero values of every kind.
    fn is_empty_value(&self) -> bool {
        !self.truthy()
    }

    fn coerce_str(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.coerce_str()).collect();
                format!("[{}]", parts.join(" "))
            }
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Domain builtins seam
// ---------------------------------------------------------------------------

/// The four contract builtins, supplied by the renderer.  Errors are plain
/// messages; the engine wraps them with template position context.
pub trait Builtins {
    /// Resolved value for `key`; fails when the variable is unresolved.
    fn env(&self, key: &str) -> Result<String, String>;
    /// Resolved value for `key`, or `fallback` when absent **or empty**.
    fn env_default(&self, key: &str, fallback: &str) -> String;
    /// Contents of the (tilde/env-expanded) file at `path`.
    fn file(&self, path: &str) -> Result<String, String>;
    /// Trimmed stdout of `cmd args...`.
    fn exec(&self, cmd: &str, args: &[String]) -> Result<String, String>;
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Expr(Pipeline),
    If {
        cond: Pipeline,
        then: Vec<Node>,
        els: Vec<Node>,
    },
    Range {
        over: Pipeline,
        body: Vec<Node>,
    },
}

#[derive(Debug, Clone)]
struct Pipeline {
    stages: Vec<Term>,
}

#[derive(Debug, Clone)]
enum Term {
    Str(String),
    Int(i64),
    Bool(bool),
    Dot,
    Call { name: String, args: Vec<Term> },
    Sub(Box<Pipeline>),
}

#[derive(Debug, Clone)]
pub struct Template {
    nodes: Vec<Node>,
}

// ---------------------------------------------------------------------------
// Lexer (inside one tag)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Pipe,
    LParen,
    RParen,
    Dot,
}

fn tokenize(tag: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = tag.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return err("unterminated string literal"),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('"') => s.push('"'),
                            Some('\\') => s.push('\\'),
                            Some(other) => {
                                return err(format!("unknown escape \\{other}"));
                            }
                            None => return err("unterminated string literal"),
                        },
                        Some(other) => s.push(other),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match num.parse::<i64>() {
                    Ok(n) => tokens.push(Token::Int(n)),
                    Err(_) => return err(format!("invalid integer literal {num:?}")),
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return err(format!("unexpected character {other:?} in template tag")),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

enum Segment {
    Text(String),
    Tag(Vec<Token>),
}

fn segment(text: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Text(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            return err("unclosed {{ tag");
        };
        segments.push(Segment::Tag(tokenize(&after[..close])?));
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

enum Terminator {
    Else,
    End,
}

pub fn parse(text: &str) -> Result<Template, TemplateError> {
    let segments = segment(text)?;
    let mut idx = 0;
    let (nodes, terminator) = parse_block(&segments, &mut idx, false)?;
    if terminator.is_some() {
        return err("unexpected {{ else }} or {{ end }} outside a block");
    }
    Ok(Template { nodes })
}

fn parse_block(
    segments: &[Segment],
    idx: &mut usize,
    in_block: bool,
) -> Result<(Vec<Node>, Option<Terminator>), TemplateError> {
    let mut nodes = Vec::new();

    while *idx < segments.len() {
        match &segments[*idx] {
            Segment::Text(text) => {
                nodes.push(Node::Text(text.clone()));
                *idx += 1;
            }
            Segment::Tag(tokens) => {
                *idx += 1;
                match tokens.first() {
                    Some(Token::Ident(kw)) if kw == "end" => {
                        if !in_block {
                            return err("unexpected {{ end }}");
                        }
                        return Ok((nodes, Some(Terminator::End)));
                    }
                    Some(Token::Ident(kw)) if kw == "else" => {
                        if !in_block {
                            return err("unexpected {{ else }}");
                        }
                        return Ok((nodes, Some(Terminator::Else)));
                    }
                    Some(Token::Ident(kw)) if kw == "if" => {
                        let cond = parse_pipeline(&tokens[1..])?;
                        let (then, terminator) = parse_block(segments, idx, true)?;
                        let els = match terminator {
                            Some(Terminator::Else) => {
                                let (els, terminator) = parse_block(segments, idx, true)?;
                                match terminator {
                                    Some(Terminator::End) => els,
                                    _ => return err("{{ else }} without {{ end }}"),
                                }
                            }
                            Some(Terminator::End) => Vec::new(),
                            None => return err("{{ if }} without {{ end }}"),
                        };
                        nodes.push(Node::If { cond, then, els });
                    }
                    Some(Token::Ident(kw)) if kw == "range" => {
                        let over = parse_pipeline(&tokens[1..])?;
                        let (body, terminator) = parse_block(segments, idx, true)?;
                        match terminator {
                            Some(Terminator::End) => {}
                            Some(Terminator::Else) => {
                                return err("{{ else }} is not valid inside {{ range }}");
                            }
                            None => return err("{{ range }} without {{ end }}"),
                        }
                        nodes.push(Node::Range { over, body });
                    }
                    _ => {
                        nodes.push(Node::Expr(parse_pipeline(tokens)?));
                    }
                }
            }
        }
    }

    Ok((nodes, None))
}

fn parse_pipeline(tokens: &[Token]) -> Result<Pipeline, TemplateError> {
    let mut pos = 0;
    let pipeline = parse_pipeline_at(tokens, &mut pos, false)?;
    if pos != tokens.len() {
        return err("trailing tokens in template tag");
    }
    Ok(pipeline)
}

/// Parse a pipeline starting at `pos`.  When `in_parens` is set, stops at
/// the matching `)` (leaving it unconsumed for the caller).
fn parse_pipeline_at(
    tokens: &[Token],
    pos: &mut usize,
    in_parens: bool,
) -> Result<Pipeline, TemplateError> {
    let mut stages = Vec::new();

    loop {
        stages.push(parse_stage(tokens, pos, in_parens)?);
        match tokens.get(*pos) {
            Some(Token::Pipe) => {
                *pos += 1;
            }
            Some(Token::RParen) if in_parens => break,
            None => break,
            Some(other) => return err(format!("unexpected token {other:?} in pipeline")),
        }
    }

    if stages.is_empty() {
        return err("empty pipeline");
    }
    Ok(Pipeline { stages })
}

fn parse_stage(
    tokens: &[Token],
    pos: &mut usize,
    in_parens: bool,
) -> Result<Term, TemplateError> {
    match tokens.get(*pos) {
        Some(Token::Ident(name)) => {
            let name = name.clone();
            *pos += 1;
            let mut args = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(Token::Pipe) | None => break,
                    Some(Token::RParen) if in_parens => break,
                    Some(_) => args.push(parse_arg(tokens, pos)?),
                }
            }
            Ok(Term::Call { name, args })
        }
        Some(_) => {
            let term = parse_arg(tokens, pos)?;
            Ok(term)
        }
        None => err("empty pipeline stage"),
    }
}

fn parse_arg(tokens: &[Token], pos: &mut usize) -> Result<Term, TemplateError> {
    match tokens.get(*pos) {
        Some(Token::Str(s)) => {
            *pos += 1;
            Ok(Term::Str(s.clone()))
        }
        Some(Token::Int(n)) => {
            *pos += 1;
            Ok(Term::Int(*n))
        }
        Some(Token::Dot) => {
            *pos += 1;
            Ok(Term::Dot)
        }
        Some(Token::Ident(name)) if name == "true" => {
            *pos += 1;
            Ok(Term::Bool(true))
        }
        Some(Token::Ident(name)) if name == "false" => {
            *pos += 1;
            Ok(Term::Bool(false))
        }
        Some(Token::LParen) => {
            *pos += 1;
            let inner = parse_pipeline_at(tokens, pos, true)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => {
                    *pos += 1;
                    Ok(Term::Sub(Box::new(inner)))
                }
                _ => err("unclosed ( in template tag"),
            }
        }
        Some(Token::Ident(name)) => err(format!(
            "bare identifier {name:?} in argument position (wrap calls in parentheses)"
        )),
        Some(other) => err(format!("unexpected token {other:?} in argument position")),
        None => err("missing argument"),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Template {
    pub fn render(&self, builtins: &dyn Builtins) -> Result<String, TemplateError> {
        let mut out = String::new();
        eval_nodes(&self.nodes, builtins, None, &mut out)?;
        Ok(out)
    }

    /// The set of env var names statically referenced as the first argument
    /// of a direct `env` or `envDefault` call.  Piped forms
    /// (`{{ "KEY" | env }}`) are intentionally not detected.
    pub fn referenced_env_vars(&self) -> HashSet<String> {
        let mut vars = HashSet::new();
        collect_env_vars(&self.nodes, &mut vars);
        vars
    }
}

fn eval_nodes(
    nodes: &[Node],
    builtins: &dyn Builtins,
    dot: Option<&Value>,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Expr(pipeline) => {
                let value = eval_pipeline(pipeline, builtins, dot)?;
                out.push_str(&value.coerce_str());
            }
            Node::If { cond, then, els } => {
                let value = eval_pipeline(cond, builtins, dot)?;
                if value.truthy() {
                    eval_nodes(then, builtins, dot, out)?;
                } else {
                    eval_nodes(els, builtins, dot, out)?;
                }
            }
            Node::Range { over, body } => {
                let value = eval_pipeline(over, builtins, dot)?;
                let Value::List(items) = value else {
                    return err("range requires a list value");
                };
                for item in &items {
                    eval_nodes(body, builtins, Some(item), out)?;
                }
            }
        }
    }
    Ok(())
}

fn eval_pipeline(
    pipeline: &Pipeline,
    builtins: &dyn Builtins,
    dot: Option<&Value>,
) -> Result<Value, TemplateError> {
    let mut stages = pipeline.stages.iter();
    let first = stages.next().ok_or_else(|| TemplateError("empty pipeline".into()))?;
    let mut value = eval_term(first, builtins, dot, None)?;

    for stage in stages {
        match stage {
            Term::Call { .. } => {
                value = eval_term(stage, builtins, dot, Some(value))?;
            }
            _ => return err("pipeline stages after the first must be function calls"),
        }
    }
    Ok(value)
}

fn eval_term(
    term: &Term,
    builtins: &dyn Builtins,
    dot: Option<&Value>,
    piped: Option<Value>,
) -> Result<Value, TemplateError> {
    match term {
        Term::Str(s) => Ok(Value::Str(s.clone())),
        Term::Int(n) => Ok(Value::Int(*n)),
        Term::Bool(b) => Ok(Value::Bool(*b)),
        Term::Dot => match dot {
            Some(v) => Ok(v.clone()),
            None => err("'.' has no value outside {{ range }}"),
        },
        Term::Sub(inner) => eval_pipeline(inner, builtins, dot),
        Term::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len() + 1);
            for arg in args {
                values.push(eval_term(arg, builtins, dot, None)?);
            }
            if let Some(piped) = piped {
                values.push(piped);
            }
            call_function(name, &values, builtins)
        }
    }
}

fn call_function(
    name: &str,
    args: &[Value],
    builtins: &dyn Builtins,
) -> Result<Value, TemplateError> {
    let arity = |n: usize| -> Result<(), TemplateError> {
        if args.len() == n {
            Ok(())
        } else {
            err(format!(
                "wrong number of arguments for {name:?}: want {n}, got {}",
                args.len()
            ))
        }
    };
    let str_arg = |i: usize| args[i].coerce_str();

    match name {
        // -- domain builtins --------------------------------------------
        "env" => {
            arity(1)?;
            builtins.env(&str_arg(0)).map(Value::Str).map_err(TemplateError)
        }
        "envDefault" => {
            arity(2)?;
            Ok(Value::Str(builtins.env_default(&str_arg(0), &str_arg(1))))
        }
        "file" => {
            arity(1)?;
            builtins.file(&str_arg(0)).map(Value::Str).map_err(TemplateError)
        }
        "exec" => {
            if args.is_empty() {
                return err("exec requires at least a command");
            }
            let exec_args: Vec<String> = args[1..].iter().map(|v| v.coerce_str()).collect();
            builtins
                .exec(&str_arg(0), &exec_args)
                .map(Value::Str)
                .map_err(TemplateError)
        }

        // -- general helpers --------------------------------------------
        "upper" => {
            arity(1)?;
            Ok(Value::Str(str_arg(0).to_uppercase()))
        }
        "lower" => {
            arity(1)?;
            Ok(Value::Str(str_arg(0).to_lowercase()))
        }
        "trim" => {
            arity(1)?;
            Ok(Value::Str(str_arg(0).trim().to_string()))
        }
        "replace" => {
            arity(3)?;
            Ok(Value::Str(str_arg(2).replace(&str_arg(0), &str_arg(1))))
        }
        "split" => {
            arity(2)?;
            let sep = str_arg(0);
            let items = str_arg(1)
                .split(&sep)
                .map(|p| Value::Str(p.to_string()))
                .collect();
            Ok(Value::List(items))
        }
        "join" => {
            arity(2)?;
            let sep = str_arg(0);
            let Value::List(items) = &args[1] else {
                return err("join requires a list value");
            };
            let parts: Vec<String> = items.iter().map(|v| v.coerce_str()).collect();
            Ok(Value::Str(parts.join(&sep)))
        }
        "b64enc" => {
            arity(1)?;
            Ok(Value::Str(BASE64.encode(str_arg(0))))
        }
        "b64dec" => {
            arity(1)?;
            let decoded = BASE64
                .decode(str_arg(0))
                .map_err(|e| TemplateError(format!("b64dec: {e}")))?;
            String::from_utf8(decoded)
                .map(Value::Str)
                .map_err(|e| TemplateError(format!("b64dec: {e}")))
        }
        "toJson" => {
            arity(1)?;
            serde_json::to_string(&args[0].to_json())
                .map(Value::Str)
                .map_err(|e| TemplateError(format!("toJson: {e}")))
        }
        "default" => {
            arity(2)?;
            if args[1].is_empty_value() {
                Ok(args[0].clone())
            } else {
                Ok(args[1].clone())
            }
        }
        "ternary" => {
            arity(3)?;
            if args[2].truthy() {
                Ok(args[0].clone())
            } else {
                Ok(args[1].clone())
            }
        }

        other => err(format!("unknown template function {other:?}")),
    }
}

// ---------------------------------------------------------------------------
// Static env extraction
// ---------------------------------------------------------------------------

fn collect_env_vars(nodes: &[Node], vars: &mut HashSet<String>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Expr(pipeline) => collect_pipeline(pipeline, vars),
            Node::If { cond, then, els } => {
                collect_pipeline(cond, vars);
                collect_env_vars(then, vars);
                collect_env_vars(els, vars);
            }
            Node::Range { over, body } => {
                collect_pipeline(over, vars);
                collect_env_vars(body, vars);
            }
        }
    }
}

fn collect_pipeline(pipeline: &Pipeline, vars: &mut HashSet<String>) {
    for (i, stage) in pipeline.stages.iter().enumerate() {
        // Only a *direct* call (the head of a pipeline) counts; env as a
        // later stage receives its key through the pipe, which static
        // extraction cannot see.
        collect_term(stage, i == 0, vars);
    }
}

fn collect_term(term: &Term, direct: bool, vars: &mut HashSet<String>) {
    match term {
        Term::Call { name, args } => {
            if direct
                && (name == "env" || name == "envDefault")
                && let Some(Term::Str(key)) = args.first()
            {
                vars.insert(key.clone());
            }
            for arg in args {
                collect_term(arg, false, vars);
            }
        }
        Term::Sub(inner) => collect_pipeline(inner, vars),
        _ => {}
    }
}
