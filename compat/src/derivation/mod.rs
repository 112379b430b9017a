//! The parsed form of a derivation.
//!
//! The wire form is the ATerm tuple
//! `Derive(outputs, inputDrvs, sources, platform, builder, args, env)`.
//! Arguments are not a supported way of passing data to a builder, so a
//! derivation declaring any is refused outright.

use bstr::{BStr, BString};

use crate::aterm;

mod errors;
mod write;

pub use errors::DerivationError;
pub use write::DERIVATION_PREFIX;

/// One declared output of a derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// Symbolic output key, e.g. `out`.
    pub id: String,
    /// Declared input-addressed path of the output.
    pub path: String,
    /// Hash algorithm name, non-empty only for fixed outputs.
    pub hash_algo: String,
    /// Lowercase hex digest, non-empty only for fixed outputs.
    pub hash_hex: String,
}

impl Output {
    /// True if this output declares content up front.
    pub fn is_fixed(&self) -> bool {
        !self.path.is_empty() && !self.hash_algo.is_empty() && !self.hash_hex.is_empty()
    }
}

/// A dependency on selected outputs of another derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputDerivation {
    /// Store name of the input derivation file.
    pub derivation: String,
    /// The output ids consumed from it.
    pub outputs: Vec<String>,
}

/// One environment entry seen by the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub key: String,
    pub value: BString,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Derivation {
    pub outputs: Vec<Output>,
    pub input_derivations: Vec<InputDerivation>,
    pub input_sources: Vec<String>,
    pub platform: String,
    pub builder: String,
    pub environment: Vec<EnvEntry>,
}

impl Derivation {
    /// Parse a derivation from its ATerm wire form.
    pub fn from_aterm_bytes(bytes: &[u8]) -> Result<Derivation, DerivationError> {
        let mut drv = Derivation::default();
        let mut argument_count = 0usize;

        let mut parser = aterm::Parser::new(bytes);
        parser.constructor("Derive", |p| {
            p.list(|p| {
                p.tuple(|p| {
                    let output = Output {
                        id: p.string_utf8()?,
                        path: p.string_utf8()?,
                        hash_algo: p.string_utf8()?,
                        hash_hex: p.string_utf8()?,
                    };
                    drv.outputs.push(output);
                    Ok(())
                })
                .map(|_| ())
            })?;

            p.list(|p| {
                p.tuple(|p| {
                    let mut input = InputDerivation {
                        derivation: p.string_utf8()?,
                        outputs: Vec::new(),
                    };
                    p.list(|p| {
                        input.outputs.push(p.string_utf8()?);
                        Ok(())
                    })?;
                    drv.input_derivations.push(input);
                    Ok(())
                })
                .map(|_| ())
            })?;

            p.list(|p| {
                drv.input_sources.push(p.string_utf8()?);
                Ok(())
            })?;

            drv.platform = p.string_utf8()?;
            drv.builder = p.string_utf8()?;

            p.list(|p| {
                argument_count += 1;
                p.string()
            })?;

            p.list(|p| {
                p.tuple(|p| {
                    let entry = EnvEntry {
                        key: p.string_utf8()?,
                        value: p.string_bytes()?,
                    };
                    drv.environment.push(entry);
                    Ok(())
                })
                .map(|_| ())
            })?;

            Ok(())
        })?;

        if !parser.at_end() {
            return Err(DerivationError::TrailingBytes);
        }
        if argument_count != 0 {
            return Err(DerivationError::UnexpectedArguments);
        }
        drv.validate()?;
        Ok(drv)
    }

    fn validate(&self) -> Result<(), DerivationError> {
        if self.outputs.is_empty() {
            return Err(DerivationError::NoOutputs);
        }
        for output in &self.outputs {
            if output.id.is_empty() || output.id.contains('/') {
                return Err(DerivationError::InvalidOutputId(output.id.clone()));
            }
        }
        if self.platform.is_empty() {
            return Err(DerivationError::InvalidPlatform);
        }
        if self.builder.is_empty() {
            return Err(DerivationError::InvalidBuilder);
        }
        Ok(())
    }

    /// True iff every output declares a path, algorithm and digest.
    pub fn has_fixed_output(&self) -> bool {
        let (mut known, mut unknown) = (0usize, 0usize);
        for output in &self.outputs {
            if output.is_fixed() {
                known += 1;
            } else {
                unknown += 1;
            }
        }
        known > 0 && unknown == 0
    }

    /// Look up a raw (unresolved) environment value.
    pub fn environment_lookup(&self, key: &str) -> Option<&BStr> {
        self.environment
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| BStr::new(&entry.value))
    }
}
