use crate::wire::MerkleHashTreeFunction;
use sha2::Digest;

fn digest<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

impl MerkleHashTreeFunction {
    /// hash over the concatenation of `parts`
    pub fn hash_parts(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            MerkleHashTreeFunction::Sha1 => digest::<sha1::Sha1>(parts),
            MerkleHashTreeFunction::Sha224 => digest::<sha2::Sha224>(parts),
            MerkleHashTreeFunction::Sha256 => digest::<sha2::Sha256>(parts),
            MerkleHashTreeFunction::Sha384 => digest::<sha2::Sha384>(parts),
            MerkleHashTreeFunction::Sha512 => digest::<sha2::Sha512>(parts),
        }
    }

    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        self.hash_parts(&[data])
    }

    /// `H(left || right)`
    pub fn hash_pair(&self, left: &[u8], right: &[u8]) -> Vec<u8> {
        self.hash_parts(&[left, right])
    }

    /// the hash of a leaf that only exists as padding to a power of two
    pub fn empty_hash(&self) -> Vec<u8> {
        vec![0; self.digest_len()]
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::sha1(MerkleHashTreeFunction::Sha1)]
    #[case::sha224(MerkleHashTreeFunction::Sha224)]
    #[case::sha256(MerkleHashTreeFunction::Sha256)]
    #[case::sha384(MerkleHashTreeFunction::Sha384)]
    #[case::sha512(MerkleHashTreeFunction::Sha512)]
    fn test_digest_len(#[case] hash_function: MerkleHashTreeFunction) {
        assert_eq!(hash_function.hash(b"abc").len(), hash_function.digest_len());
        assert_eq!(hash_function.empty_hash().len(), hash_function.digest_len());
    }

    #[test]
    fn test_known_digest() {
        let expected: [u8; 20] = [0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d];
        assert_eq!(MerkleHashTreeFunction::Sha1.hash(b"abc"), expected.to_vec());
    }

    #[test]
    fn test_pair_is_concatenation() {
        let f = MerkleHashTreeFunction::Sha256;
        assert_eq!(f.hash_pair(b"ab", b"c"), f.hash(b"abc"));
        assert_ne!(f.hash_pair(b"c", b"ab"), f.hash(b"abc"));
    }
}
