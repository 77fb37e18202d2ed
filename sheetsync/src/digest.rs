use sha2::{Digest, Sha256};

/// Hash over length-prefixed parts with a fixed algorithm, so tokens
/// written to the store stay comparable across builds and toolchains.
pub(crate) struct StableHasher(Sha256);

impl StableHasher {
    pub(crate) fn new() -> Self {
        StableHasher(Sha256::new())
    }

    pub(crate) fn part(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update((bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub(crate) fn count(&mut self, n: usize) -> &mut Self {
        self.part((n as u64).to_le_bytes())
    }

    /// First 8 bytes of the digest as 16 hex chars.
    pub(crate) fn finish(self) -> String {
        self.0.finalize()[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let mut a = StableHasher::new();
        a.part("ab").part("c");
        let mut b = StableHasher::new();
        b.part("a").part("bc");
        let a = a.finish();
        assert_eq!(a, "43ee655579de01ca");
        assert_ne!(a, b.finish());

        let mut again = StableHasher::new();
        again.part("ab").part("c");
        assert_eq!(a, again.finish());
    }
}
