//! Streaming hash functions used by the store.
//!
//! BLAKE2s is the canonical hash for deriving store names, SHA-256 is
//! only consulted when verifying fixed-output derivations. Both are
//! exposed behind one small capability set so callers can hold a
//! `Box<dyn HashFunction>` picked at runtime from a derivation's
//! declared algorithm.

use blake2::Blake2s256;
use digest::Digest;
use sha2::Sha256;

/// A streaming hash state.
///
/// `update` may be interleaved with `digest`; calling `digest` twice
/// without an intervening `update` yields the same bytes. `reset`
/// returns the state to that of a freshly constructed function.
pub trait HashFunction {
    /// Number of bytes written by [`HashFunction::digest`].
    fn size(&self) -> usize;

    /// Ideal input block size of this function.
    fn block_size(&self) -> usize;

    /// Absorb `buf` into the hash state.
    fn update(&mut self, buf: &[u8]);

    /// Write the digest of everything absorbed so far into `out`.
    ///
    /// `out` must hold at least [`HashFunction::size`] bytes; excess
    /// bytes are left untouched.
    fn digest(&mut self, out: &mut [u8]);

    /// Discard all absorbed input.
    fn reset(&mut self);
}

macro_rules! impl_hash_function {
    ($name:ident, $inner:ty, $size:expr, $block_size:expr) => {
        impl $name {
            pub fn new() -> Self {
                Self { inner: <$inner>::new() }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl HashFunction for $name {
            fn size(&self) -> usize {
                $size
            }

            fn block_size(&self) -> usize {
                $block_size
            }

            fn update(&mut self, buf: &[u8]) {
                Digest::update(&mut self.inner, buf);
            }

            fn digest(&mut self, out: &mut [u8]) {
                // finalize() consumes the state, so digest a clone to
                // keep the running state intact for further updates.
                let digest = self.inner.clone().finalize();
                out[..$size].copy_from_slice(&digest);
            }

            fn reset(&mut self) {
                self.inner = <$inner>::new();
            }
        }
    };
}

/// BLAKE2s-256, the store's canonical content hash.
#[derive(Clone)]
pub struct Blake2s {
    inner: Blake2s256,
}

impl_hash_function!(Blake2s, Blake2s256, 32, 64);

/// SHA-256, accepted for fixed-output verification.
#[derive(Clone)]
pub struct Sha256Hash {
    inner: Sha256,
}

impl_hash_function!(Sha256Hash, Sha256, 32, 64);

/// Hash algorithms a derivation may declare for a fixed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Blake2s,
    Sha256,
}

impl HashAlgo {
    /// Parse the algorithm field of a derivation output.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blake2s" => Some(HashAlgo::Blake2s),
            "sha256" => Some(HashAlgo::Sha256),
            _ => None,
        }
    }

    /// Construct a fresh hash state for this algorithm.
    pub fn function(&self) -> Box<dyn HashFunction> {
        match self {
            HashAlgo::Blake2s => Box::new(Blake2s::new()),
            HashAlgo::Sha256 => Box::new(Sha256Hash::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn blake2s_empty() {
        let mut h = Blake2s::new();
        let mut out = [0u8; 32];
        h.digest(&mut out);
        assert_eq!(
            out,
            hex!("69217a3079908094e11121d042354a7c1f55b6482ca1a51e1b250dfd1ed0eef9")
        );
    }

    #[test]
    fn blake2s_streaming_matches_one_shot() {
        let mut whole = Blake2s::new();
        whole.update(b"hello world");

        let mut chunked = Blake2s::new();
        chunked.update(b"hello");
        chunked.update(b" world");

        let (mut a, mut b) = ([0u8; 32], [0u8; 32]);
        whole.digest(&mut a);
        chunked.digest(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn digest_is_idempotent_and_interleavable() {
        let mut h = Sha256Hash::new();
        h.update(b"fixed data\n");

        let (mut first, mut second) = ([0u8; 32], [0u8; 32]);
        h.digest(&mut first);
        h.digest(&mut second);
        assert_eq!(first, second);
        assert_eq!(
            first,
            hex!("4849d721e60eab02ac4296f5228ff2aac81a6d06fa880608784c93002d7956aa")
        );

        // updating after a digest must continue the stream
        h.update(b"more");
        let mut third = [0u8; 32];
        h.digest(&mut third);
        assert_ne!(first, third);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut h = Blake2s::new();
        h.update(b"garbage");
        h.reset();
        h.update(b"hello");

        let mut fresh = Blake2s::new();
        fresh.update(b"hello");

        let (mut a, mut b) = ([0u8; 32], [0u8; 32]);
        h.digest(&mut a);
        fresh.digest(&mut b);
        assert_eq!(a, b);
        assert_eq!(
            a,
            hex!("19213bacc58dee6dbde3ceb9a47cbb330b3d86f8cca8997eb00be456f140ca25")
        );
    }

    #[test]
    fn algo_from_name() {
        assert_eq!(HashAlgo::from_name("sha256"), Some(HashAlgo::Sha256));
        assert_eq!(HashAlgo::from_name("blake2s"), Some(HashAlgo::Blake2s));
        assert_eq!(HashAlgo::from_name("md5"), None);
        assert_eq!(HashAlgo::from_name(""), None);
    }

    #[test]
    fn sizes() {
        assert_eq!(Blake2s::new().size(), 32);
        assert_eq!(Blake2s::new().block_size(), 64);
        assert_eq!(Sha256Hash::new().size(), 32);
        assert_eq!(Sha256Hash::new().block_size(), 64);
    }
}
