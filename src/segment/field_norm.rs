// Document lengths quantized to one byte, following Lucene's SmallFloat
// (4-bit mantissa). Lengths below 24 are exact.

const NUM_FREE_VALUES: u32 = 24;
pub const MAX_FIELDNORM_ID: u8 = 255;

pub fn fieldnorm_to_id(len: u32) -> u8 {
    let len = len.min(i32::MAX as u32);
    if len < NUM_FREE_VALUES {
        len as u8
    } else {
        (NUM_FREE_VALUES + long_to_int4(len - NUM_FREE_VALUES)) as u8
    }
}

pub fn id_to_fieldnorm(id: u8) -> u32 {
    let id = id as u32;
    if id < NUM_FREE_VALUES {
        id
    } else {
        NUM_FREE_VALUES + int4_to_long(id - NUM_FREE_VALUES)
    }
}

fn long_to_int4(i: u32) -> u32 {
    let num_bits = 32 - i.leading_zeros();
    if num_bits < 4 {
        i
    } else {
        let shift = num_bits - 4;
        ((i >> shift) & 0x07) | ((shift + 1) << 3)
    }
}

fn int4_to_long(i: u32) -> u32 {
    let bits = i & 0x07;
    let shift = (i >> 3) as i32 - 1;
    if shift == -1 {
        bits
    } else {
        (bits | 0x08) << shift
    }
}
