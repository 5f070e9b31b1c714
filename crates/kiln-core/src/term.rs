//! The labelled-tuple term tree and its canonical text form.
//!
//! Build state is expressed as a small tree language: quoted strings,
//! lists, tuples and labelled applications such as `Derive(...)`. The
//! printed form is canonical (no whitespace, fixed escaping), so the id of
//! a term is simply the hash of its printed bytes. The parser accepts
//! whitespace between tokens but is otherwise strict: unknown escapes,
//! unterminated strings and trailing input are errors.

use std::fmt;

use thiserror::Error;

/// Maximum nesting depth accepted by the parser.
///
/// Terms produced by the engine are a few levels deep; the bound exists so
/// hostile input cannot overflow the stack.
pub const MAX_TERM_DEPTH: usize = 128;

/// A node in the term tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// A quoted string atom.
    Str(String),
    /// An ordered list, printed `[a,b,...]`.
    List(Vec<Term>),
    /// An unlabelled tuple, printed `(a,b,...)`.
    Tuple(Vec<Term>),
    /// A labelled application, printed `Name(a,b,...)`.
    App(String, Vec<Term>),
}

impl Term {
    /// Renders the canonical printed form.
    #[must_use]
    pub fn print(&self) -> String {
        let mut out = String::new();
        self.print_into(&mut out);
        out
    }

    fn print_into(&self, out: &mut String) {
        match self {
            Self::Str(s) => {
                out.push('"');
                for c in s.chars() {
                    match c {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        _ => out.push(c),
                    }
                }
                out.push('"');
            },
            Self::List(items) => {
                out.push('[');
                print_seq(items, out);
                out.push(']');
            },
            Self::Tuple(items) => {
                out.push('(');
                print_seq(items, out);
                out.push(')');
            },
            Self::App(name, args) => {
                out.push_str(name);
                out.push('(');
                print_seq(args, out);
                out.push(')');
            },
        }
    }

    /// Parses a term from its printed form.
    ///
    /// # Errors
    ///
    /// Returns [`TermError::Syntax`] for malformed input and
    /// [`TermError::TooDeep`] when nesting exceeds [`MAX_TERM_DEPTH`].
    pub fn parse(input: &str) -> Result<Self, TermError> {
        let mut parser = Parser {
            bytes: input.as_bytes(),
            pos: 0,
        };
        parser.skip_ws();
        let term = parser.term(MAX_TERM_DEPTH)?;
        parser.skip_ws();
        if parser.pos != parser.bytes.len() {
            return Err(parser.syntax("trailing input after term"));
        }
        Ok(term)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.print())
    }
}

fn print_seq(items: &[Term], out: &mut String) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        item.print_into(out);
    }
}

/// Error produced by [`Term::parse`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TermError {
    /// The input does not follow the term grammar.
    #[error("syntax error at byte {offset}: {message}")]
    Syntax {
        /// Byte offset of the offending input.
        offset: usize,
        /// What was expected or found.
        message: String,
    },

    /// The input nests deeper than [`MAX_TERM_DEPTH`].
    #[error("term nesting deeper than {MAX_TERM_DEPTH} levels")]
    TooDeep,
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn syntax(&self, message: impl Into<String>) -> TermError {
        TermError::Syntax {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), TermError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.syntax(format!("expected `{}`", char::from(byte))))
        }
    }

    fn term(&mut self, depth: usize) -> Result<Term, TermError> {
        if depth == 0 {
            return Err(TermError::TooDeep);
        }
        match self.peek() {
            Some(b'"') => self.string().map(Term::Str),
            Some(b'[') => {
                self.pos += 1;
                self.seq(b']', depth).map(Term::List)
            },
            Some(b'(') => {
                self.pos += 1;
                self.seq(b')', depth).map(Term::Tuple)
            },
            Some(c) if c.is_ascii_alphabetic() => {
                let name = self.name();
                self.expect(b'(')?;
                let args = self.seq(b')', depth)?;
                Ok(Term::App(name, args))
            },
            Some(_) => Err(self.syntax("expected a string, list, tuple or application")),
            None => Err(self.syntax("unexpected end of input")),
        }
    }

    fn name(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }

    /// Parses a comma-separated sequence up to (and consuming) `close`.
    fn seq(&mut self, close: u8, depth: usize) -> Result<Vec<Term>, TermError> {
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.term(depth - 1)?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    self.skip_ws();
                },
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok(items);
                },
                Some(_) => return Err(self.syntax(format!("expected `,` or `{}`", char::from(close)))),
                None => return Err(self.syntax("unterminated sequence")),
            }
        }
    }

    fn string(&mut self) -> Result<String, TermError> {
        self.expect(b'"')?;
        let mut content = Vec::new();
        loop {
            match self.peek() {
                Some(b'"') => {
                    self.pos += 1;
                    return String::from_utf8(content).map_err(|_| self.syntax("string is not valid UTF-8"));
                },
                Some(b'\\') => {
                    self.pos += 1;
                    let escaped = match self.peek() {
                        Some(b'"') => b'"',
                        Some(b'\\') => b'\\',
                        Some(b'n') => b'\n',
                        Some(b'r') => b'\r',
                        Some(b't') => b'\t',
                        _ => return Err(self.syntax("unknown escape sequence")),
                    };
                    content.push(escaped);
                    self.pos += 1;
                },
                Some(c) => {
                    content.push(c);
                    self.pos += 1;
                },
                None => return Err(self.syntax("unterminated string")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(input: &str) {
        let term = Term::parse(input).unwrap();
        assert_eq!(term.print(), input);
        assert_eq!(Term::parse(&term.print()).unwrap(), term);
    }

    #[test]
    fn test_round_trip_each_shape() {
        round_trip(r#""hello""#);
        round_trip("[]");
        round_trip(r#"["a","b"]"#);
        round_trip(r#"("a","b")"#);
        round_trip(r#"Include("ab12")"#);
        round_trip(r#"Derive([("/out","ff")],["aa"],"/bin/builder","x86_64-linux",[("K","V")])"#);
        round_trip(r#"Slice(["aa"],[("/p","aa",[])])"#);
    }

    #[test]
    fn test_escapes_round_trip() {
        let term = Term::Str("line\nquote\" back\\slash\ttab".to_string());
        assert_eq!(Term::parse(&term.print()).unwrap(), term);
    }

    #[test]
    fn test_parser_accepts_whitespace() {
        let term = Term::parse(" Slice( [ \"aa\" ] , [ ] ) ").unwrap();
        assert_eq!(term.print(), r#"Slice(["aa"],[])"#);
    }

    #[test]
    fn test_rejects_trailing_input() {
        let err = Term::parse(r#""a" "b""#).unwrap_err();
        assert!(matches!(err, TermError::Syntax { .. }));
    }

    #[test]
    fn test_rejects_unknown_escape() {
        assert!(matches!(
            Term::parse(r#""\q""#).unwrap_err(),
            TermError::Syntax { .. }
        ));
    }

    #[test]
    fn test_rejects_unterminated_string() {
        let err = Term::parse(r#""never ends"#).unwrap_err();
        assert!(matches!(err, TermError::Syntax { offset, .. } if offset > 0));
    }

    #[test]
    fn test_rejects_bare_word() {
        assert!(Term::parse("Derive").is_err());
    }

    #[test]
    fn test_depth_guard() {
        let deep = format!("{}{}{}", "[".repeat(200), r#""x""#, "]".repeat(200));
        assert!(matches!(Term::parse(&deep).unwrap_err(), TermError::TooDeep));
    }

    #[test]
    fn test_printing_is_deterministic() {
        let term = Term::parse(r#"Slice(["aa","bb"],[("/p","aa",["bb"])])"#).unwrap();
        assert_eq!(term.print(), term.print());
    }
}
