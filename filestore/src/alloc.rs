use std::convert::TryInto;

use crate::error::{Result, StoreError};

/// Size of the used-count header in front of a persisted bitmap image.
pub const BITMAP_HEADER_SIZE: usize = 4;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

/// In-memory mirror of block occupancy, one bit per block.
///
/// The used counter is kept in step with the bits by every mutation, so
/// `used()` never has to rescan.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    bitmap: Vec<u64>,
    len: usize,
    used: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bitmap: vec![0; (len + 63) / 64],
            len,
            used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.len - self.used
    }

    pub fn get(&self, blocknr: usize) -> State {
        assert!(blocknr < self.len, "bit {} beyond bitmap of {}", blocknr, self.len);
        // Grab the u64 containing the significant bit.
        let outer = self.bitmap[blocknr / 64];
        let mask = 0b01_u64 << (blocknr % 64);
        if outer & mask == 0 {
            State::Free
        } else {
            State::Used
        }
    }

    /// Marks a block used. Returns false if it already was.
    pub fn set_reserved(&mut self, blocknr: usize) -> bool {
        if self.get(blocknr) == State::Used {
            return false;
        }
        self.bitmap[blocknr / 64] |= 0b01_u64 << (blocknr % 64);
        self.used += 1;
        true
    }

    /// Marks a block free. Returns false if it already was.
    pub fn set_free(&mut self, blocknr: usize) -> bool {
        if self.get(blocknr) == State::Free {
            return false;
        }
        self.bitmap[blocknr / 64] &= !(0b01_u64 << (blocknr % 64));
        self.used -= 1;
        true
    }

    /// Lowest-numbered free block, if any.
    pub fn first_free(&self) -> Option<usize> {
        NextAvailable::new(self).next()
    }

    /// Serializes the bitmap as a little endian i32 used-count followed by the
    /// packed bits, bit `n % 8` of byte `n / 8` describing block `n`.
    pub fn to_image(&self) -> Vec<u8> {
        let nbytes = (self.len + 7) / 8;
        let mut image = Vec::with_capacity(BITMAP_HEADER_SIZE + nbytes);
        image.extend_from_slice(&(self.used as i32).to_le_bytes());
        image.extend(
            self.bitmap
                .iter()
                .flat_map(|word| word.to_le_bytes())
                .take(nbytes),
        );
        image
    }

    /// Rebuilds a bitmap of `len` bits from an image written by `to_image`.
    ///
    /// Returns the bitmap together with the used-count recorded in the image
    /// header. The bitmap's own counter is always the scanned count of set bits,
    /// callers decide what to do when the two disagree.
    pub fn from_image(image: &[u8], len: usize) -> Result<(Self, i32)> {
        let nbytes = (len + 7) / 8;
        if image.len() < BITMAP_HEADER_SIZE + nbytes {
            return Err(StoreError::InvalidRecord("bitmap image is truncated"));
        }
        let recorded = i32::from_le_bytes(image[0..BITMAP_HEADER_SIZE].try_into().unwrap());

        let mut map = Bitmap::new(len);
        let bits = &image[BITMAP_HEADER_SIZE..BITMAP_HEADER_SIZE + nbytes];
        for (i, chunk) in bits.chunks(8).enumerate() {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            map.bitmap[i] = u64::from_le_bytes(word);
        }
        // Bits past `len` in the last byte are never set by `to_image`; mask them
        // anyway so a damaged tail cannot inflate the count.
        if len % 64 != 0 {
            if let Some(last) = map.bitmap.last_mut() {
                *last &= (1u64 << (len % 64)) - 1;
            }
        }
        map.used = map.bitmap.iter().map(|w| w.count_ones() as usize).sum();
        Ok((map, recorded))
    }
}

/// Naive first-fit allocation policy: yields free blocks in ascending order,
/// skipping over fully used words.
pub struct NextAvailable<'a> {
    /// Keeps track of the next starting place for looking for available blocks.
    marker: usize,
    bitmap: &'a Bitmap,
}

impl<'a> NextAvailable<'a> {
    pub fn new(bitmap: &'a Bitmap) -> Self {
        Self { marker: 0, bitmap }
    }
}

impl<'a> Iterator for NextAvailable<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.marker < self.bitmap.len {
            let word = self.bitmap.bitmap[self.marker / 64];
            if self.marker % 64 == 0 && word == u64::MAX {
                self.marker += 64;
                continue;
            }
            let i = self.marker;
            self.marker += 1;
            if let State::Free = self.bitmap.get(i) {
                return Some(i);
            }
        }
        None
    }
}
