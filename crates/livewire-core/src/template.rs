//! A minimal templating pass that splits source on `{{ … }}` boundaries.
//!
//! Text between expressions becomes the static spans of a [`RenderTree`];
//! each expression evaluates against a JSON scope and fills one dynamic
//! hole. Three expression forms are understood:
//!
//! - `{{.path.to.field}}` (or bare `{{.}}`) — look up a value in the scope
//! - `{{template "name" .path}}` — render a registered sub-template, whose
//!   output lands as a nested tree
//! - `{{component "id"}}` — splice in an externally rendered subtree
//!
//! String values are HTML-escaped; other scalars are stringified. A missing
//! path renders as the empty string.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::tree::{Dynamic, RenderTree};

/// Sub-template calls may not nest deeper than this.
const MAX_TEMPLATE_DEPTH: usize = 32;

/// Errors from parsing or rendering a template.
#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    /// An `{{` without a matching `}}`.
    #[error("unclosed expression at byte {0}")]
    Unclosed(usize),

    /// An expression that is not one of the understood forms.
    #[error("unsupported expression {0:?}")]
    BadExpression(String),

    /// A `template` call referencing a name that was never registered.
    #[error("unknown sub-template {0:?}")]
    UnknownTemplate(String),

    /// Sub-template calls nested too deeply, likely a recursive partial.
    #[error("sub-template recursion too deep")]
    TooDeep,
}

/// One parsed expression between `{{` and `}}`.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    /// `.a.b.c`; an empty path is the whole scope.
    Path(Vec<String>),
    /// `template "name" .path`.
    Call { name: String, path: Vec<String> },
    /// `component "id"`.
    Component(String),
}

/// A parsed template: static spans plus one expression per hole.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    statics: Vec<String>,
    exprs: Vec<Expr>,
}

/// Named sub-templates available to `{{template "name"}}` calls.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<String, Template>,
}

impl TemplateSet {
    /// Registers a sub-template under `name`.
    pub fn insert(&mut self, name: impl Into<String>, template: Template) {
        self.templates.insert(name.into(), template);
    }

    fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }
}

impl Template {
    /// Parses template source, tokenizing on `{{ … }}` boundaries.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut statics = Vec::new();
        let mut exprs = Vec::new();
        let mut rest = source;
        let mut offset = 0;
        while let Some(open) = rest.find("{{") {
            let close = rest[open..]
                .find("}}")
                .ok_or(TemplateError::Unclosed(offset + open))?
                + open;
            statics.push(rest[..open].to_string());
            exprs.push(parse_expr(rest[open + 2..close].trim())?);
            offset += close + 2;
            rest = &rest[close + 2..];
        }
        statics.push(rest.to_string());
        Ok(Self { statics, exprs })
    }

    /// Renders against a scope, with no sub-templates or components.
    pub fn render(&self, scope: &Value) -> Result<RenderTree, TemplateError> {
        self.render_in(scope, &TemplateSet::default(), &HashMap::new())
    }

    /// Renders against a scope with registered sub-templates and externally
    /// rendered component subtrees.
    pub fn render_in(
        &self,
        scope: &Value,
        partials: &TemplateSet,
        subtrees: &HashMap<String, RenderTree>,
    ) -> Result<RenderTree, TemplateError> {
        self.render_depth(scope, partials, subtrees, 0)
    }

    fn render_depth(
        &self,
        scope: &Value,
        partials: &TemplateSet,
        subtrees: &HashMap<String, RenderTree>,
        depth: usize,
    ) -> Result<RenderTree, TemplateError> {
        if depth > MAX_TEMPLATE_DEPTH {
            return Err(TemplateError::TooDeep);
        }
        let mut dynamics = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            let dynamic = match expr {
                Expr::Path(path) => Dynamic::Text(stringify(lookup(scope, path))),
                Expr::Call { name, path } => {
                    let sub = partials
                        .get(name)
                        .ok_or_else(|| TemplateError::UnknownTemplate(name.clone()))?;
                    let sub_scope = lookup(scope, path).cloned().unwrap_or(Value::Null);
                    Dynamic::Tree(sub.render_depth(&sub_scope, partials, subtrees, depth + 1)?)
                }
                Expr::Component(id) => match subtrees.get(id) {
                    Some(tree) => Dynamic::Tree(tree.clone()),
                    // Component not mounted yet; renders as nothing.
                    None => Dynamic::Text(String::new()),
                },
            };
            dynamics.push(dynamic);
        }
        Ok(RenderTree::new(self.statics.clone(), dynamics))
    }
}

fn parse_expr(src: &str) -> Result<Expr, TemplateError> {
    if let Some(path) = src.strip_prefix('.') {
        if src.split_whitespace().count() > 1 {
            return Err(TemplateError::BadExpression(src.to_string()));
        }
        return Ok(Expr::Path(split_path(path)));
    }
    let mut words = src.split_whitespace();
    match words.next() {
        Some("template") => {
            let name = unquote(words.next().unwrap_or(""))
                .ok_or_else(|| TemplateError::BadExpression(src.to_string()))?;
            let path = match words.next() {
                Some(arg) => {
                    let arg = arg
                        .strip_prefix('.')
                        .ok_or_else(|| TemplateError::BadExpression(src.to_string()))?;
                    split_path(arg)
                }
                None => Vec::new(),
            };
            Ok(Expr::Call { name, path })
        }
        Some("component") => {
            let id = unquote(words.next().unwrap_or(""))
                .ok_or_else(|| TemplateError::BadExpression(src.to_string()))?;
            Ok(Expr::Component(id))
        }
        _ => Err(TemplateError::BadExpression(src.to_string())),
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn unquote(word: &str) -> Option<String> {
    word.strip_prefix('"')
        .and_then(|w| w.strip_suffix('"'))
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
}

fn lookup<'a>(scope: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = scope;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => escape_html(s),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => escape_html(&other.to_string()),
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
