//! Encoder argument vectors and the quoted-string tokenizer for user-supplied
//! extra parameters.

use std::ffi::{OsStr, OsString};

/// Ordered argument vector for one encoder invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncoderArgs(Vec<OsString>);

impl EncoderArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.0.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &OsString> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy string view, for logging and tests
    pub fn to_strings(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Split a parameter string the way a shell would split unescaped words.
///
/// Whitespace separates tokens outside quotes. Single and double quotes group
/// text (including whitespace) and are removed; quoted and unquoted runs that
/// touch form one token, so `-metadata title="Live Set"` yields
/// `["-metadata", "title=Live Set"]`. There are no escape sequences. An
/// unterminated quote runs to the end of the input.
pub fn split_quoted(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote = Quote::None;

    for c in input.chars() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => {
                if c == '"' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_token = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if in_token {
        tokens.push(current);
    }

    tokens
}
