//! Keccak binary Merkle tree over batch leaves.
//!
//! Leaf order is batch insertion order. Levels with an odd node count
//! duplicate their last node ("last-leaf duplication"); operators and
//! clients verify inclusion under the same rule, so the convention is pinned
//! here and covered by the round-trip tests below.

use alloy_primitives::{keccak256, B256};

fn hash_pair(left: &B256, right: &B256) -> B256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_slice());
    buf[32..].copy_from_slice(right.as_slice());
    keccak256(buf)
}

/// A fully materialized tree. Built once per sealed batch; proofs are read
/// out per entry when acknowledgments are dispatched.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `layers[0]` is the leaf layer, last layer is `[root]`.
    layers: Vec<Vec<B256>>,
}

impl MerkleTree {
    /// Builds the tree. Returns `None` for an empty leaf set; a batch is
    /// never sealed empty.
    pub fn from_leaves(leaves: Vec<B256>) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }
        let mut layers = vec![leaves];
        while layers.last().map(Vec::len) != Some(1) {
            let current = layers.last().expect("layers is non-empty");
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                next.push(hash_pair(left, right));
            }
            layers.push(next);
        }
        Some(Self { layers })
    }

    pub fn root(&self) -> B256 {
        self.layers.last().expect("tree has a root layer")[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.layers[0].len()
    }

    /// Sibling path from leaf `index` up to (excluding) the root. When a
    /// level duplicated its last node, the node itself is the sibling.
    pub fn proof(&self, index: usize) -> Option<Vec<B256>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut path = Vec::with_capacity(self.layers.len() - 1);
        let mut i = index;
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling = layer.get(i ^ 1).unwrap_or(&layer[i]);
            path.push(*sibling);
            i >>= 1;
        }
        Some(path)
    }
}

/// Recomputes the root from a leaf and its sibling path. This is the check
/// clients run against the acknowledged batch root.
pub fn verify_inclusion(leaf: B256, index: usize, proof: &[B256], root: B256) -> bool {
    let mut node = leaf;
    let mut i = index;
    for sibling in proof {
        node = if i & 1 == 0 {
            hash_pair(&node, sibling)
        } else {
            hash_pair(sibling, &node)
        };
        i >>= 1;
    }
    i == 0 && node == root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<B256> {
        (0..n).map(|i| keccak256([i as u8])).collect()
    }

    #[test]
    fn single_leaf_tree_is_its_own_root() {
        let leaf = keccak256([7u8]);
        let tree = MerkleTree::from_leaves(vec![leaf]).unwrap();
        assert_eq!(tree.root(), leaf);
        assert_eq!(tree.proof(0).unwrap(), Vec::<B256>::new());
        assert!(verify_inclusion(leaf, 0, &[], tree.root()));
    }

    #[test]
    fn empty_leaf_set_builds_no_tree() {
        assert!(MerkleTree::from_leaves(Vec::new()).is_none());
    }

    #[test]
    fn two_leaf_root_is_pair_hash() {
        let ls = leaves(2);
        let tree = MerkleTree::from_leaves(ls.clone()).unwrap();
        assert_eq!(tree.root(), hash_pair(&ls[0], &ls[1]));
    }

    #[test]
    fn odd_level_duplicates_last_leaf() {
        let ls = leaves(3);
        let tree = MerkleTree::from_leaves(ls.clone()).unwrap();
        let left = hash_pair(&ls[0], &ls[1]);
        let right = hash_pair(&ls[2], &ls[2]);
        assert_eq!(tree.root(), hash_pair(&left, &right));

        // The duplicated node's sibling is itself.
        assert_eq!(tree.proof(2).unwrap()[0], ls[2]);
    }

    #[test]
    fn proofs_verify_for_every_index() {
        for n in 1..=17 {
            let ls = leaves(n);
            let tree = MerkleTree::from_leaves(ls.clone()).unwrap();
            for (i, leaf) in ls.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(
                    verify_inclusion(*leaf, i, &proof, tree.root()),
                    "n={n} i={i}"
                );
            }
        }
    }

    #[test]
    fn wrong_index_or_leaf_fails() {
        let ls = leaves(5);
        let tree = MerkleTree::from_leaves(ls.clone()).unwrap();
        let proof = tree.proof(1).unwrap();
        assert!(!verify_inclusion(ls[1], 2, &proof, tree.root()));
        assert!(!verify_inclusion(ls[0], 1, &proof, tree.root()));
        assert!(!verify_inclusion(ls[1], 1, &proof, keccak256([0u8])));
    }

    #[test]
    fn proof_out_of_range_is_none() {
        let tree = MerkleTree::from_leaves(leaves(4)).unwrap();
        assert!(tree.proof(4).is_none());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn inclusion_round_trip(n in 1usize..64, seed in any::<u8>()) {
                let ls: Vec<B256> = (0..n).map(|i| keccak256([seed, i as u8])).collect();
                let tree = MerkleTree::from_leaves(ls.clone()).unwrap();
                for (i, leaf) in ls.iter().enumerate() {
                    let proof = tree.proof(i).unwrap();
                    prop_assert!(verify_inclusion(*leaf, i, &proof, tree.root()));
                }
            }
        }
    }
}
