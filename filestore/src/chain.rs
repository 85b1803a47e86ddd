//! Splitting of byte payloads into block-sized slices and back.
//!
//! Pure computation: the codec decides slice boundaries, the caller moves the
//! slices to and from blocks.

/// One block's worth of a payload.
#[derive(Debug, PartialEq, Eq)]
pub struct ChainSlice<'a> {
    pub sequence_index: usize,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct ChainCodec {
    capacity: usize,
}

impl ChainCodec {
    /// `capacity` is the payload size of one block and must be non-zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "chain capacity must be non-zero");
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks needed to hold `len` bytes. An empty payload still takes one block.
    pub fn blocks_needed(&self, len: usize) -> usize {
        if len == 0 {
            1
        } else {
            (len + self.capacity - 1) / self.capacity
        }
    }

    /// Cuts `bytes` into `blocks_needed(bytes.len())` ordered slices, every one
    /// full except possibly the last.
    pub fn split<'a>(&self, bytes: &'a [u8]) -> Vec<ChainSlice<'a>> {
        if bytes.is_empty() {
            return vec![ChainSlice {
                sequence_index: 0,
                payload: bytes,
            }];
        }
        bytes
            .chunks(self.capacity)
            .enumerate()
            .map(|(sequence_index, payload)| ChainSlice {
                sequence_index,
                payload,
            })
            .collect()
    }

    /// Concatenates payloads given in chain order.
    pub fn reassemble<I, P>(&self, payloads: I) -> Vec<u8>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mut out = Vec::new();
        for p in payloads {
            out.extend_from_slice(p.as_ref());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_takes_one_empty_block() {
        let codec = ChainCodec::new(10);
        assert_eq!(codec.blocks_needed(0), 1);
        let slices = codec.split(&[]);
        assert_eq!(slices.len(), 1);
        assert!(slices[0].payload.is_empty());
    }

    #[test]
    fn exact_multiple_has_no_trailing_block() {
        let codec = ChainCodec::new(10);
        assert_eq!(codec.blocks_needed(10), 1);
        assert_eq!(codec.blocks_needed(20), 2);
        assert_eq!(codec.blocks_needed(21), 3);
        assert_eq!(codec.split(&[7; 20]).len(), 2);
    }

    #[test]
    fn default_geometry_needs_three_blocks_for_150000_bytes() {
        let codec = ChainCodec::new(51200 - 16);
        assert_eq!(codec.blocks_needed(150_000), 3);
    }

    #[test]
    fn slices_are_ordered_and_reassemble() {
        let codec = ChainCodec::new(4);
        let data: Vec<u8> = (0..11).collect();
        let slices = codec.split(&data);

        let indexes: Vec<usize> = slices.iter().map(|s| s.sequence_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(slices[2].payload, &[8, 9, 10]);

        let joined = codec.reassemble(slices.iter().map(|s| s.payload));
        assert_eq!(joined, data);
    }
}
