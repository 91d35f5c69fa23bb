//! Merkle Summary for Ledger Entries
//!
//! A Merkle root over entry digests in storage order lets a whole ledger be
//! anchored or compared with a single value. Odd nodes are paired with
//! themselves.

use serde::Serialize;
use sha2::{Digest as _, Sha256};
use tracing::debug;

use crate::audit::entry::LedgerEntry;
use crate::audit::hasher::Digest;

fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Digest::from_bytes(hasher.finalize().into())
}

/// Every level of the tree, leaves first. Empty input yields no levels.
fn build_levels(leaves: Vec<Digest>) -> Vec<Vec<Digest>> {
    if leaves.is_empty() {
        return Vec::new();
    }

    let mut levels = vec![leaves];
    while let Some(level) = levels.last().filter(|level| level.len() > 1) {
        let next: Vec<Digest> = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => hash_pair(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
        levels.push(next);
    }
    levels
}

fn leaves(entries: &[LedgerEntry]) -> Vec<Digest> {
    entries.iter().map(|entry| entry.entry_digest).collect()
}

/// Merkle root over entry digests, or `None` for an empty ledger.
pub fn merkle_root(entries: &[LedgerEntry]) -> Option<Digest> {
    let root = build_levels(leaves(entries))
        .last()
        .and_then(|level| level.first().copied());
    if let Some(root) = &root {
        debug!("Merkle root over {} entries: {}", entries.len(), root);
    }
    root
}

/// Verify Merkle root against entries
pub fn verify_merkle_root(entries: &[LedgerEntry], claimed_root: &Digest) -> bool {
    merkle_root(entries).as_ref() == Some(claimed_root)
}

/// Which side of the running hash a sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SiblingSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProofStep {
    pub sibling: Digest,
    pub side: SiblingSide,
}

/// Inclusion proof for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MerkleProof {
    pub sequence: u64,
    pub leaf: Digest,
    pub steps: Vec<ProofStep>,
    pub root: Digest,
}

impl MerkleProof {
    /// Verify this proof
    pub fn verify(&self) -> bool {
        let computed = self.steps.iter().fold(self.leaf, |current, step| match step.side {
            SiblingSide::Right => hash_pair(&current, &step.sibling),
            SiblingSide::Left => hash_pair(&step.sibling, &current),
        });
        computed == self.root
    }

    pub fn summary(&self) -> String {
        format!(
            "Merkle proof for #{}: {} steps, root: {}",
            self.sequence,
            self.steps.len(),
            self.root
        )
    }
}

/// Build an inclusion proof for the entry at `position`.
pub fn generate_merkle_proof(entries: &[LedgerEntry], position: usize) -> Option<MerkleProof> {
    let levels = build_levels(leaves(entries));
    let leaf = *levels.first()?.get(position)?;
    let root = *levels.last()?.first()?;

    let mut index = position;
    let mut steps = Vec::with_capacity(levels.len().saturating_sub(1));
    for level in &levels[..levels.len() - 1] {
        let (sibling_index, side) = if index % 2 == 0 {
            (index + 1, SiblingSide::Right)
        } else {
            (index - 1, SiblingSide::Left)
        };
        let sibling = level.get(sibling_index).copied().unwrap_or(level[index]);
        steps.push(ProofStep { sibling, side });
        index /= 2;
    }

    Some(MerkleProof {
        sequence: entries[position].sequence,
        leaf,
        steps,
        root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::parse_payload;
    use chrono::Utc;

    fn create_test_entries(count: usize) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = Vec::new();
        for i in 0..count {
            let previous = entries
                .last()
                .map(|e| e.entry_digest)
                .unwrap_or(Digest::GENESIS);
            let payload = parse_payload(&format!(r#"{{"index":{}}}"#, i)).unwrap();
            entries.push(LedgerEntry::seal(
                i as u64,
                Utc::now(),
                "test_type".to_string(),
                payload,
                previous,
            ));
        }
        entries
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(merkle_root(&[]), None);

        let entries = create_test_entries(1);
        assert_eq!(merkle_root(&entries), Some(entries[0].entry_digest));
    }

    #[test]
    fn test_odd_node_is_paired_with_itself() {
        let entries = create_test_entries(3);
        let d: Vec<Digest> = entries.iter().map(|e| e.entry_digest).collect();
        let expected = hash_pair(&hash_pair(&d[0], &d[1]), &hash_pair(&d[2], &d[2]));
        assert_eq!(merkle_root(&entries), Some(expected));
    }

    #[test]
    fn test_merkle_root_verification() {
        let entries = create_test_entries(8);
        let root = merkle_root(&entries).unwrap();

        assert!(verify_merkle_root(&entries, &root));
        assert!(!verify_merkle_root(&entries, &Digest::GENESIS));
        assert!(!verify_merkle_root(&entries[..7], &root));
    }

    #[test]
    fn test_merkle_proofs_for_every_position() {
        for count in [1usize, 2, 5, 8, 13] {
            let entries = create_test_entries(count);
            let root = merkle_root(&entries).unwrap();
            for position in 0..count {
                let proof = generate_merkle_proof(&entries, position).unwrap();
                assert_eq!(proof.root, root);
                assert_eq!(proof.leaf, entries[position].entry_digest);
                assert!(proof.verify(), "proof failed for {}/{}", position, count);
            }
        }
    }

    #[test]
    fn test_tampered_proof_fails() {
        let entries = create_test_entries(6);
        let mut proof = generate_merkle_proof(&entries, 4).unwrap();
        proof.leaf = entries[3].entry_digest;
        assert!(!proof.verify());

        assert!(generate_merkle_proof(&entries, 6).is_none());
    }
}
