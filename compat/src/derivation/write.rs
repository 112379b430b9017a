//! Serialisation of derivations back into their ATerm wire form.

use std::io::{self, Write};

use crate::aterm::escape_bytes;

use super::Derivation;

pub const DERIVATION_PREFIX: &str = "Derive";

fn write_field<W: Write, S: AsRef<[u8]>>(w: &mut W, s: S) -> io::Result<()> {
    w.write_all(b"\"")?;
    w.write_all(&escape_bytes(s.as_ref()))?;
    w.write_all(b"\"")
}

fn write_string_list<W: Write, S: AsRef<[u8]>>(w: &mut W, elements: &[S]) -> io::Result<()> {
    w.write_all(b"[")?;
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        write_field(w, element)?;
    }
    w.write_all(b"]")
}

impl Derivation {
    /// Write the ATerm serialisation. The only errors are those of the
    /// writer itself.
    pub fn serialize<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(DERIVATION_PREFIX.as_bytes())?;
        w.write_all(b"([")?;

        for (i, output) in self.outputs.iter().enumerate() {
            if i > 0 {
                w.write_all(b",")?;
            }
            w.write_all(b"(")?;
            write_field(w, &output.id)?;
            w.write_all(b",")?;
            write_field(w, &output.path)?;
            w.write_all(b",")?;
            write_field(w, &output.hash_algo)?;
            w.write_all(b",")?;
            write_field(w, &output.hash_hex)?;
            w.write_all(b")")?;
        }

        w.write_all(b"],[")?;
        for (i, input) in self.input_derivations.iter().enumerate() {
            if i > 0 {
                w.write_all(b",")?;
            }
            w.write_all(b"(")?;
            write_field(w, &input.derivation)?;
            w.write_all(b",")?;
            write_string_list(w, &input.outputs)?;
            w.write_all(b")")?;
        }
        w.write_all(b"],")?;

        write_string_list(w, &self.input_sources)?;
        w.write_all(b",")?;

        write_field(w, &self.platform)?;
        w.write_all(b",")?;
        write_field(w, &self.builder)?;

        // arguments are rejected at parse time, so always empty
        w.write_all(b",[],[")?;

        for (i, entry) in self.environment.iter().enumerate() {
            if i > 0 {
                w.write_all(b",")?;
            }
            w.write_all(b"(")?;
            write_field(w, &entry.key)?;
            w.write_all(b",")?;
            write_field(w, &entry.value)?;
            w.write_all(b")")?;
        }
        w.write_all(b"])")
    }

    /// The ATerm serialisation as a byte vector.
    pub fn to_aterm_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        // writes to a Vec cannot fail
        self.serialize(&mut buffer).unwrap();
        buffer
    }
}
