//! A cursor over an in-memory ATerm buffer.
//!
//! Closures passed to [`Parser::constructor`], [`Parser::tuple`] and
//! [`Parser::list`] consume the body one element at a time. Separating
//! commas and closing delimiters are consumed as each element
//! completes, so a closure simply reads its fields in order. The
//! structural methods return the buffer tail starting at the parsed
//! element, which callers may hand to a fresh `Parser` for deferred
//! re-traversal without copying.

use bstr::BString;
use thiserror::Error;

use super::fields;

/// Nesting bound for tuples and lists.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Separator or terminator missing where one was required.
    #[error("malformed element")]
    Malformed,
    /// An element of a different kind (or constructor name) was found.
    #[error("wrong element")]
    WrongElement,
    /// The buffer ended inside a term.
    #[error("unexpected end of term")]
    EndOfTerm,
    /// A closing delimiter appeared without a matching opener.
    #[error("mismatched nesting")]
    BadLogic,
    /// Nesting exceeded [`MAX_DEPTH`].
    #[error("nesting deeper than {MAX_DEPTH}")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Tuple,
    List,
}

impl Scope {
    fn closer(self) -> u8 {
        match self {
            Scope::Tuple => b')',
            Scope::List => b']',
        }
    }
}

pub struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
    scopes: Vec<Scope>,
}

impl<'a> Parser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Parser {
            buf,
            pos: 0,
            scopes: Vec::new(),
        }
    }

    /// True once the whole buffer has been consumed.
    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn push(&mut self, scope: Scope) -> Result<(), Error> {
        if self.scopes.len() == MAX_DEPTH {
            return Err(Error::Overflow);
        }
        self.scopes.push(scope);
        Ok(())
    }

    /// Leave the innermost scope, consuming its closing delimiter.
    fn pop(&mut self) -> Result<(), Error> {
        if self.scopes.pop().is_none() {
            return Err(Error::BadLogic);
        }
        self.pos += 1;
        Ok(())
    }

    /// Consume whatever follows a completed element: a separating
    /// comma, or the closing delimiter of the innermost scope.
    fn check_end(&mut self) -> Result<(), Error> {
        match self.peek() {
            Some(b',') => {
                self.pos += 1;
                Ok(())
            }
            _ if self.scopes.is_empty() => Ok(()),
            Some(c) if c == self.scopes[self.scopes.len() - 1].closer() => self.pop(),
            Some(_) => Err(Error::Malformed),
            None => Err(Error::EndOfTerm),
        }
    }

    /// Consume the literal `name` followed by a tuple body.
    pub fn constructor<F>(&mut self, name: &str, body: F) -> Result<&'a [u8], Error>
    where
        F: FnOnce(&mut Parser<'a>) -> Result<(), Error>,
    {
        if !self.buf[self.pos..].starts_with(name.as_bytes()) {
            return Err(Error::WrongElement);
        }
        let base = self.pos;
        self.pos += name.len();
        self.tuple(body)?;
        Ok(&self.buf[base..])
    }

    /// Consume `(`, the fields read by `body`, and `)`.
    pub fn tuple<F>(&mut self, body: F) -> Result<&'a [u8], Error>
    where
        F: FnOnce(&mut Parser<'a>) -> Result<(), Error>,
    {
        match self.peek() {
            None => return Err(Error::EndOfTerm),
            Some(b'(') => (),
            Some(_) => return Err(Error::WrongElement),
        }
        let base = self.pos;
        self.pos += 1;
        self.push(Scope::Tuple)?;
        body(self)?;
        // the final field popped the tuple scope; this consumes the
        // separator that follows the tuple itself
        self.check_end()?;
        Ok(&self.buf[base..])
    }

    /// Consume `[`, invoking `element` until the matching `]`.
    /// Empty lists are permitted.
    pub fn list<F>(&mut self, mut element: F) -> Result<&'a [u8], Error>
    where
        F: FnMut(&mut Parser<'a>) -> Result<(), Error>,
    {
        match self.peek() {
            None => return Err(Error::EndOfTerm),
            Some(b'[') => (),
            Some(_) => return Err(Error::WrongElement),
        }
        let base = self.pos;
        self.pos += 1;

        if self.peek() == Some(b']') {
            self.pos += 1;
            self.check_end()?;
            return Ok(&self.buf[base..]);
        }

        let outer = self.scopes.len();
        self.push(Scope::List)?;
        // each element consumes its own separator; the one that meets
        // `]` pops the scope and ends the loop
        while self.scopes.len() > outer {
            element(self)?;
        }
        self.check_end()?;
        Ok(&self.buf[base..])
    }

    /// Consume a quoted string, discarding its content.
    pub fn string(&mut self) -> Result<(), Error> {
        self.string_bytes().map(|_| ())
    }

    /// Consume a quoted string and return its unescaped bytes.
    pub fn string_bytes(&mut self) -> Result<BString, Error> {
        match self.peek() {
            None => return Err(Error::EndOfTerm),
            Some(b'"') => (),
            Some(_) => return Err(Error::WrongElement),
        }
        let input = &self.buf[self.pos..];
        let (rest, content) = fields::parse_bytes_field(input).map_err(|_| Error::Malformed)?;
        self.pos += input.len() - rest.len();
        self.check_end()?;
        Ok(content)
    }

    /// Consume a quoted string that must be valid UTF-8.
    pub fn string_utf8(&mut self) -> Result<String, Error> {
        let bytes = self.string_bytes()?;
        String::from_utf8(bytes.into()).map_err(|_| Error::Malformed)
    }
}
