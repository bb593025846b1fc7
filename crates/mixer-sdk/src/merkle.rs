//! SHA-256 Merkle tree over delivered outputs. The root, signed by the
//! custodian, is the completion proof presented on dispute.

use sha2::{Digest, Sha256};

use crate::error::{Result, SdkError};

const LEAF_DOMAIN: &[u8] = b"mixer_leaf_v1:";
const NODE_PREFIX: u8 = 0x01;
const COMPLETION_DOMAIN: &[u8] = b"mixer_completion_v1:";

pub fn leaf_hash(address: &str, amount: u64, nonce: &str, request_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(LEAF_DOMAIN);
    hasher.update(address.as_bytes());
    hasher.update([0u8]);
    hasher.update(amount.to_le_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update([0u8]);
    hasher.update(request_id.as_bytes());
    hasher.finalize().into()
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Digest the custodian signs to attest completion.
pub fn completion_digest(root: &[u8; 32], request_id: &str, service_id: &str, timestamp: i64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(COMPLETION_DOMAIN);
    hasher.update(root);
    hasher.update(b"|");
    hasher.update(request_id.as_bytes());
    hasher.update(b"|");
    hasher.update(service_id.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.to_le_bytes());
    hasher.finalize().into()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf: [u8; 32],
    pub siblings: Vec<[u8; 32]>,
    pub sibling_is_right: Vec<bool>,
}

impl MerkleProof {
    pub fn compute_root(&self) -> [u8; 32] {
        self.siblings
            .iter()
            .zip(&self.sibling_is_right)
            .fold(self.leaf, |node, (sibling, &right)| {
                if right {
                    hash_pair(&node, sibling)
                } else {
                    hash_pair(sibling, &node)
                }
            })
    }

    pub fn verify(&self, root: &[u8; 32]) -> bool {
        self.siblings.len() == self.sibling_is_right.len() && &self.compute_root() == root
    }

    /// Rebuilds a proof from its hex wire form.
    pub fn from_hex(leaf: &str, siblings: &[String], sibling_is_right: &[bool]) -> Result<Self> {
        Ok(Self {
            leaf: decode_node(leaf)?,
            siblings: siblings.iter().map(|s| decode_node(s)).collect::<Result<_>>()?,
            sibling_is_right: sibling_is_right.to_vec(),
        })
    }
}

pub fn decode_node(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| SdkError::InvalidProof(format!("bad hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| SdkError::InvalidProof("node must be 32 bytes".into()))
}

/// Odd levels duplicate their last node.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    pub fn new(leaves: Vec<[u8; 32]>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(SdkError::MerkleTree("no leaves".into()));
        }

        let mut levels = vec![leaves];
        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let next = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_pair(left, right),
                    [single] => hash_pair(single, single),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(next);
        }

        Ok(Self { levels })
    }

    pub fn root(&self) -> [u8; 32] {
        self.levels[self.levels.len() - 1][0]
    }

    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    pub fn proof(&self, index: usize) -> Result<MerkleProof> {
        if index >= self.len() {
            return Err(SdkError::MerkleTree(format!(
                "leaf index {} out of range ({} leaves)",
                index,
                self.len()
            )));
        }

        let mut siblings = Vec::with_capacity(self.levels.len() - 1);
        let mut sibling_is_right = Vec::with_capacity(self.levels.len() - 1);
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let is_left = idx % 2 == 0;
            let sibling_idx = if is_left { idx + 1 } else { idx - 1 };
            let sibling = level.get(sibling_idx).copied().unwrap_or(level[idx]);
            siblings.push(sibling);
            sibling_is_right.push(is_left);
            idx /= 2;
        }

        Ok(MerkleProof {
            leaf: self.levels[0][index],
            siblings,
            sibling_is_right,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<[u8; 32]> {
        (0..n)
            .map(|i| leaf_hash(&format!("addr{}", i), 100 + i as u64, "nonce", "req-1"))
            .collect()
    }

    #[test]
    fn test_every_leaf_proves_against_root() {
        for n in [1, 2, 3, 5, 8] {
            let tree = MerkleTree::new(leaves(n)).unwrap();
            for i in 0..n {
                let proof = tree.proof(i).unwrap();
                assert!(proof.verify(&tree.root()), "leaf {} of {}", i, n);
            }
        }
    }

    #[test]
    fn test_tampered_leaf_fails() {
        let tree = MerkleTree::new(leaves(3)).unwrap();
        let mut proof = tree.proof(1).unwrap();
        proof.leaf = leaf_hash("addr1", 999, "nonce", "req-1");
        assert!(!proof.verify(&tree.root()));
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let l = leaves(1);
        let tree = MerkleTree::new(l.clone()).unwrap();
        assert_eq!(tree.root(), l[0]);
        assert!(tree.proof(0).unwrap().siblings.is_empty());
    }

    #[test]
    fn test_empty_tree_rejected() {
        assert!(MerkleTree::new(vec![]).is_err());
    }

    #[test]
    fn test_leaf_binds_request() {
        assert_ne!(
            leaf_hash("a", 1, "n", "req-1"),
            leaf_hash("a", 1, "n", "req-2")
        );
    }

    #[test]
    fn test_hex_roundtrip_of_proof() {
        let tree = MerkleTree::new(leaves(4)).unwrap();
        let proof = tree.proof(2).unwrap();
        let siblings: Vec<String> = proof.siblings.iter().map(hex::encode).collect();
        let rebuilt =
            MerkleProof::from_hex(&hex::encode(proof.leaf), &siblings, &proof.sibling_is_right).unwrap();
        assert!(rebuilt.verify(&tree.root()));
    }
}
