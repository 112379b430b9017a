/// Escape a byte sequence for embedding in a quoted ATerm string.
/// Surrounding quotes are not added.
pub fn escape_bytes<P: AsRef<[u8]>>(s: P) -> Vec<u8> {
    let s = s.as_ref();
    let mut out = Vec::with_capacity(s.len());
    for b in s {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'"' => out.extend_from_slice(b"\\\""),
            _ => out.push(*b),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::escape_bytes;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"", b"")]
    #[case::plain(b"out", b"out")]
    #[case::doublequote(b"\"", b"\\\"")]
    #[case::backslash(b"\\", b"\\\\")]
    #[case::newline(b"a\nb", b"a\\nb")]
    #[case::colon(b":", b":")]
    fn escape(#[case] input: &[u8], #[case] expected: &[u8]) {
        assert_eq!(expected, escape_bytes(input));
    }
}
