//! Set-of-bits helpers. Bits are zero-based from the least significant end; positions
//! outside the mask width are ignored.

use std::collections::BTreeSet;

pub type Mask = u64;

pub fn bit(position: u32) -> Mask {
    (1 as Mask).checked_shl(position).unwrap_or(0)
}

pub fn bits_to_mask<'a>(bits: impl IntoIterator<Item = &'a u32>) -> Mask {
    bits.into_iter().fold(0, |mask, b| mask | bit(*b))
}

pub fn mask_to_bits(mask: Mask) -> BTreeSet<u32> {
    (0..Mask::BITS).filter(|b| mask & bit(*b) != 0).collect()
}

/// If `position` is on in `mask`, turn every bit in `ones` on too.
pub fn constrain_ones(mask: Mask, position: u32, ones: &BTreeSet<u32>) -> Mask {
    let power = bit(position);
    if mask & power != 0 {
        mask | power | bits_to_mask(ones)
    } else {
        mask
    }
}

/// If `position` is off in `mask`, turn every bit in `zeroes` off too.
pub fn constrain_zeroes(mask: Mask, position: u32, zeroes: &BTreeSet<u32>) -> Mask {
    let power = bit(position);
    if mask & power != 0 {
        mask
    } else {
        mask & !(power | bits_to_mask(zeroes))
    }
}
