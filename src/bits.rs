//! Bit-range accessors for MMC/SD register buffers.
//!
//! The card registers (CID, CSD, SCR, SSR) are kept as byte arrays in the
//! transmission order defined by the MMC/SD specifications: the most
//! significant byte first, bits within a byte LSB-first. Bit index 0 is
//! therefore the least significant bit of the *last* byte, ascending toward
//! the first byte. All structured register fields go through these two
//! accessors.

/// Extract the inclusive bit range `from..=to` from `buf` as an integer.
pub const fn get_bits(buf: &[u8], from: u32, to: u32) -> u64 {
    assert!(from <= to && to - from < 64);
    assert!((to as usize) < buf.len() * 8);

    let mut value = 0u64;
    let mut bit = to + 1;
    while bit > from {
        bit -= 1;
        let byte = buf.len() - 1 - (bit as usize / 8);
        value = (value << 1) | ((buf[byte] >> (bit % 8)) & 1) as u64;
    }
    value
}

/// Store the low `to - from + 1` bits of `value` into the inclusive bit
/// range `from..=to` of `buf`.
pub const fn set_bits(value: u64, buf: &mut [u8], from: u32, to: u32) {
    assert!(from <= to && to - from < 64);
    assert!((to as usize) < buf.len() * 8);

    let mut bit = from;
    while bit <= to {
        let byte = buf.len() - 1 - (bit as usize / 8);
        let mask = 1u8 << (bit % 8);
        if (value >> (bit - from)) & 1 != 0 {
            buf[byte] |= mask;
        } else {
            buf[byte] &= !mask;
        }
        bit += 1;
    }
}

#[test]
fn test_bit_zero_is_lsb_of_last_byte() {
    let mut buf = [0u8; 4];
    set_bits(1, &mut buf, 0, 0);
    assert_eq!(buf, [0x00, 0x00, 0x00, 0x01]);
    assert_eq!(get_bits(&buf, 0, 0), 1);

    set_bits(1, &mut buf, 31, 31);
    assert_eq!(buf, [0x80, 0x00, 0x00, 0x01]);
    assert_eq!(get_bits(&buf, 31, 31), 1);
}

#[test]
fn test_cross_byte_field() {
    // C_SIZE-style field straddling byte boundaries.
    let mut buf = [0u8; 16];
    set_bits(0xfff, &mut buf, 62, 73);
    assert_eq!(get_bits(&buf, 62, 73), 0xfff);
    // Neighbours untouched.
    assert_eq!(get_bits(&buf, 74, 79), 0);
    assert_eq!(get_bits(&buf, 50, 61), 0);

    set_bits(0xa5a, &mut buf, 62, 73);
    assert_eq!(get_bits(&buf, 62, 73), 0xa5a);
}

#[test]
fn test_set_clears_stale_bits() {
    let mut buf = [0xffu8; 2];
    set_bits(0, &mut buf, 4, 11);
    assert_eq!(buf, [0xf0, 0x0f]);
    assert_eq!(get_bits(&buf, 4, 11), 0);
}
