use mpt_lib::{StateError, StateResult};

/// Erasure-decode seam. `blocks` is the ordered member list of one coding
/// group, data blocks first and parity blocks last; an empty block marks a
/// member that could not be retrieved.
///
/// Contract: decoding succeeds iff at least `blocks.len() - parity_count`
/// genuine blocks are supplied; otherwise `StateError::Codec`.
pub trait Codec: Send + Sync {
    fn decode(
        &self,
        blocks: &[Vec<u8>],
        parity_count: usize,
        target_index: Option<usize>,
    ) -> StateResult<Vec<u8>>;
}

/// Single-parity XOR reference codec.
///
/// The parity block is the bytewise XOR of all data blocks, each
/// zero-padded to the width of the longest member, so any one missing
/// member is the XOR of the remaining ones. The trait seam is where a real
/// Reed-Solomon codec would plug in; this implementation reconstructs at
/// most one missing block per group.
#[derive(Debug, Clone, Copy, Default)]
pub struct XorParityCodec;

impl XorParityCodec {
    pub fn new() -> Self {
        Self
    }

    fn group_width(blocks: &[Vec<u8>]) -> usize {
        blocks.iter().map(|b| b.len()).max().unwrap_or(0)
    }

    fn xor_into(acc: &mut [u8], block: &[u8]) {
        for (i, byte) in block.iter().enumerate() {
            acc[i] ^= byte;
        }
    }

    /// Produce the parity block of `data_blocks`. Used by tests and the
    /// peer simulator to fabricate valid coding groups; group construction
    /// itself stays outside this crate.
    pub fn encode(&self, data_blocks: &[Vec<u8>]) -> Vec<u8> {
        let width = Self::group_width(data_blocks);
        let mut parity = vec![0u8; width];
        for block in data_blocks {
            Self::xor_into(&mut parity, block);
        }
        parity
    }
}

impl Codec for XorParityCodec {
    fn decode(
        &self,
        blocks: &[Vec<u8>],
        parity_count: usize,
        target_index: Option<usize>,
    ) -> StateResult<Vec<u8>> {
        if parity_count == 0 || parity_count >= blocks.len() {
            return Err(StateError::InvalidParam(format!(
                "parity count {} invalid for group of {}",
                parity_count,
                blocks.len()
            )));
        }

        let present = blocks.iter().filter(|b| !b.is_empty()).count();
        if present < blocks.len() - parity_count {
            return Err(StateError::Codec(format!(
                "{} of {} blocks retrieved, need {}",
                present,
                blocks.len(),
                blocks.len() - parity_count
            )));
        }

        let missing: Vec<usize> = blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_empty())
            .map(|(i, _)| i)
            .collect();
        let target = match target_index {
            Some(index) if index < blocks.len() => index,
            Some(index) => {
                return Err(StateError::InvalidParam(format!(
                    "target index {} out of range",
                    index
                )))
            }
            None => missing.first().copied().unwrap_or(0),
        };

        if !blocks[target].is_empty() {
            return Ok(blocks[target].clone());
        }
        if missing.len() > 1 {
            return Err(StateError::Codec(format!(
                "xor parity reconstructs one missing block, {} are missing",
                missing.len()
            )));
        }

        let width = Self::group_width(blocks);
        let mut recovered = vec![0u8; width];
        for block in blocks {
            Self::xor_into(&mut recovered, block);
        }
        Ok(recovered)
    }
}
