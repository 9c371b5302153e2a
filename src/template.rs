//! Template rendering for outgoing mail.
//!
//! The gateway only needs `render(source, context)`. `SimpleRenderer`
//! covers `{{ name }}` substitution; richer engines plug in through
//! [`TemplateRenderer`].

use std::collections::BTreeMap;

use crate::error::RenderError;

/// String template engine.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, source: &str, context: &BTreeMap<String, String>) -> Result<String, RenderError>;

    /// Parse without rendering.
    fn check_syntax(&self, source: &str) -> Result<(), RenderError>;
}

/// `{{ variable }}` substitution.
#[derive(Debug, Clone)]
pub struct SimpleRenderer {
    /// Fail on variables missing from the context instead of rendering them empty.
    pub strict: bool,
}

impl Default for SimpleRenderer {
    fn default() -> Self {
        Self { strict: true }
    }
}

enum Token<'a> {
    Text(&'a str),
    Var { name: &'a str },
}

fn tokenize(source: &str) -> Result<Vec<Token<'_>>, RenderError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut offset = 0;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            tokens.push(Token::Text(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            return Err(RenderError::Syntax {
                offset: offset + open,
                reason: "unclosed variable tag".into(),
            });
        };
        let name = after[..close].trim();
        if !is_identifier(name) {
            return Err(RenderError::Syntax {
                offset: offset + open,
                reason: format!("invalid variable name {name:?}"),
            });
        }
        tokens.push(Token::Var { name });
        let consumed = open + 2 + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Text(rest));
    }
    Ok(tokens)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

impl TemplateRenderer for SimpleRenderer {
    fn render(&self, source: &str, context: &BTreeMap<String, String>) -> Result<String, RenderError> {
        let mut out = String::with_capacity(source.len());
        for token in tokenize(source)? {
            match token {
                Token::Text(text) => out.push_str(text),
                Token::Var { name } => match context.get(name) {
                    Some(value) => out.push_str(value),
                    None if self.strict => return Err(RenderError::MissingVariable(name.to_string())),
                    None => {}
                },
            }
        }
        Ok(out)
    }

    fn check_syntax(&self, source: &str) -> Result<(), RenderError> {
        tokenize(source).map(|_| ())
    }
}
