//! nom combinators for single quoted ATerm fields.

use bstr::BString;
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag};
use nom::character::complete::char as nomchar;
use nom::combinator::{map, value};
use nom::sequence::delimited;
use nom::IResult;

/// Parse the inside of a quoted field, undoing any `\`-escaping (which
/// is why this allocates).
fn parse_escaped_bytes(i: &[u8]) -> IResult<&[u8], BString> {
    escaped_transform(
        is_not("\"\\"),
        '\\',
        alt((
            value("\\".as_bytes(), nomchar('\\')),
            value("\n".as_bytes(), nomchar('n')),
            value("\t".as_bytes(), nomchar('t')),
            value("\r".as_bytes(), nomchar('r')),
            value("\"".as_bytes(), nomchar('"')),
        )),
    )(i)
    .map(|(i, v)| (i, BString::new(v)))
}

/// Parse a double-quoted field into its unescaped bytes.
pub(crate) fn parse_bytes_field(i: &[u8]) -> IResult<&[u8], BString> {
    delimited(
        nomchar('"'),
        // either unescaped content or the empty string
        alt((parse_escaped_bytes, map(tag(b""), |_| BString::default()))),
        nomchar('"'),
    )(i)
}
