//! Encoder parameter templates.
//!
//! A template is a caller-supplied argument string with two positional slots: `{0}` for the
//! input and `{1}` for the output. It is tokenised once, shell-style, so quoted paths survive
//! substitution as single arguments.

use std::path::Path;
use crate::error::{PipelineError, Result};

/// Template used by the merge workflows: concatenate and copy streams without re-encoding.
pub const CONCAT_COPY_PARAMETERS: &str = "{0} -c copy {1}";

const INPUT_SLOT: &str = "{0}";
const OUTPUT_SLOT: &str = "{1}";

/// What the `{0}` slot expands to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputArgs {
    /// A single literal source path
    File(String),
    /// `-f concat -safe 0 -i <manifest>`
    Concat(String),
}

impl InputArgs {
    pub fn file(path: &Path) -> Self {
        InputArgs::File(path.to_string_lossy().into_owned())
    }

    pub fn concat(manifest: &Path) -> Self {
        InputArgs::Concat(manifest.to_string_lossy().into_owned())
    }

    fn expand(&self) -> Vec<String> {
        match self {
            InputArgs::File(path) => vec![path.clone()],
            InputArgs::Concat(manifest) => vec![
                "-f".to_string(),
                "concat".to_string(),
                "-safe".to_string(),
                "0".to_string(),
                "-i".to_string(),
                manifest.clone(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Input,
    Output,
}

/// A parsed parameter template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterTemplate {
    tokens: Vec<Vec<Piece>>,
}

impl ParameterTemplate {
    /// Parse a template, requiring both the `{0}` and `{1}` slots
    pub fn parse(template: &str) -> Result<Self> {
        let words = split_words(template)?;
        let tokens: Vec<Vec<Piece>> = words.iter().map(|w| split_slots(w)).collect();

        let has = |wanted: &Piece| tokens.iter().flatten().any(|p| p == wanted);
        if !has(&Piece::Input) {
            return Err(PipelineError::Template(format!(
                "missing input slot {INPUT_SLOT} in \"{template}\""
            )));
        }
        if !has(&Piece::Output) {
            return Err(PipelineError::Template(format!(
                "missing output slot {OUTPUT_SLOT} in \"{template}\""
            )));
        }

        Ok(Self { tokens })
    }

    /// Fill both slots and return the argument list.
    ///
    /// A token that is exactly `{0}` expands to every input argument; a `{0}` embedded in a
    /// larger token is replaced textually, which only makes sense for a single-file input.
    pub fn render(&self, input: &InputArgs, output: &Path) -> Result<Vec<String>> {
        let output = output.to_string_lossy();
        let mut args = Vec::new();

        for token in &self.tokens {
            if let [Piece::Input] = token.as_slice() {
                args.extend(input.expand());
                continue;
            }

            let mut arg = String::new();
            for piece in token {
                match piece {
                    Piece::Literal(text) => arg.push_str(text),
                    Piece::Output => arg.push_str(&output),
                    Piece::Input => match input {
                        InputArgs::File(path) => arg.push_str(path),
                        InputArgs::Concat(_) => {
                            return Err(PipelineError::Template(
                                "concat input slot must be a standalone argument".to_string(),
                            ))
                        }
                    },
                }
            }
            args.push(arg);
        }

        Ok(args)
    }
}

/// Split on whitespace, honouring single and double quotes.
///
/// A backslash escapes a following quote or backslash; any other backslash is literal, which
/// keeps Windows-style paths intact.
fn split_words(template: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => match chars.peek() {
                Some(&next) if next == '"' || next == '\'' || next == '\\' => {
                    current.push(next);
                    chars.next();
                }
                _ => current.push('\\'),
            },
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(PipelineError::Template(format!("unterminated {q} quote")));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn split_slots(word: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut rest = word;

    while !rest.is_empty() {
        let next = [(INPUT_SLOT, Piece::Input), (OUTPUT_SLOT, Piece::Output)]
            .into_iter()
            .filter_map(|(slot, piece)| rest.find(slot).map(|at| (at, slot.len(), piece)))
            .min_by_key(|(at, _, _)| *at);

        match next {
            Some((at, len, piece)) => {
                if at > 0 {
                    pieces.push(Piece::Literal(rest[..at].to_string()));
                }
                pieces.push(piece);
                rest = &rest[at + len..];
            }
            None => {
                pieces.push(Piece::Literal(rest.to_string()));
                break;
            }
        }
    }

    if pieces.is_empty() {
        // A quoted empty string is still an argument
        pieces.push(Piece::Literal(String::new()));
    }
    pieces
}
