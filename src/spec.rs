//! Card templates and capacity encoding.
//!
//! A [`CardSpec`] is an immutable template of real-world card registers.
//! Constructing a card copies the template; the auto-detect templates
//! additionally encode the backing-store size into the CSD capacity fields
//! and patch a capacity label plus a per-card serial into the CID so
//! simultaneously mounted images stay distinguishable in logs.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::ModelError;
use crate::bits::{get_bits, set_bits};
use crate::crc::crc7_trailer;
use crate::state::CardFamily;

/// Operating voltage window 2.7-3.6V, common to all templates.
pub const OCR_VOLTAGE_WINDOW: u32 = 0x00ff_8000;
/// Power-up-complete bit, set once the reset latency has elapsed.
pub const OCR_POWER_UP: u32 = 1 << 31;
/// Card-capacity-status bit, set for sector-addressed (CSD structure 1)
/// cards.
pub const OCR_HIGH_CAPACITY: u32 = 1 << 30;

// CSD bit ranges shared by both structures.
const CSD_STRUCTURE: (u32, u32) = (126, 127);
const CSD_TAAC: (u32, u32) = (112, 119);
const CSD_TRAN_SPEED: (u32, u32) = (96, 103);
const CSD_CCC: (u32, u32) = (84, 95);
const CSD_READ_BL_LEN: (u32, u32) = (80, 83);
const CSD_READ_BL_PARTIAL: (u32, u32) = (79, 79);
const CSD_ERASE_BLK_EN: (u32, u32) = (46, 46);
const CSD_SECTOR_SIZE: (u32, u32) = (39, 45);
const CSD_R2W_FACTOR: (u32, u32) = (26, 28);
const CSD_WRITE_BL_LEN: (u32, u32) = (22, 25);

// Structure 0: block count factored into C_SIZE x 2^(C_SIZE_MULT+2).
const CSD_C_SIZE: (u32, u32) = (62, 73);
const CSD_VDD_CURR: (u32, u32) = (50, 61);
const CSD_C_SIZE_MULT: (u32, u32) = (47, 49);

// Structure 1: flat sector count in 512 KiB units.
const CSD_C_SIZE_HC: (u32, u32) = (48, 69);

/// Temporary write protect, the only CSD bit command handlers touch.
pub(crate) const CSD_TMP_WRITE_PROTECT: (u32, u32) = (12, 12);

// SSR bit ranges (of the 512-bit SD status register).
pub(crate) const SSR_DAT_BUS_WIDTH: (u32, u32) = (510, 511);
const SSR_SPEED_CLASS: (u32, u32) = (440, 447);

/// CID product-name field (5 ASCII characters).
const CID_PNM: (u32, u32) = (64, 103);
/// CID product serial number.
const CID_PSN: (u32, u32) = (24, 55);

/// Recompute the CRC7 trailer byte of a 16-byte register.
pub(crate) const fn register_trailer(reg: &[u8; 16]) -> u8 {
    let mut head = [0u8; 15];
    let mut i = 0;
    while i < 15 {
        head[i] = reg[i];
        i += 1;
    }
    crc7_trailer(&head)
}

const fn csd_common(structure: u64, read_bl_len: u8) -> [u8; 16] {
    let mut csd = [0u8; 16];
    set_bits(structure, &mut csd, CSD_STRUCTURE.0, CSD_STRUCTURE.1);
    // 1ms access time, 25MHz transfer, mandatory command classes.
    set_bits(0x0e, &mut csd, CSD_TAAC.0, CSD_TAAC.1);
    set_bits(0x32, &mut csd, CSD_TRAN_SPEED.0, CSD_TRAN_SPEED.1);
    set_bits(0x5b5, &mut csd, CSD_CCC.0, CSD_CCC.1);
    set_bits(read_bl_len as u64, &mut csd, CSD_READ_BL_LEN.0, CSD_READ_BL_LEN.1);
    set_bits(1, &mut csd, CSD_READ_BL_PARTIAL.0, CSD_READ_BL_PARTIAL.1);
    set_bits(1, &mut csd, CSD_ERASE_BLK_EN.0, CSD_ERASE_BLK_EN.1);
    set_bits(0x7f, &mut csd, CSD_SECTOR_SIZE.0, CSD_SECTOR_SIZE.1);
    set_bits(0x2, &mut csd, CSD_R2W_FACTOR.0, CSD_R2W_FACTOR.1);
    set_bits(read_bl_len as u64, &mut csd, CSD_WRITE_BL_LEN.0, CSD_WRITE_BL_LEN.1);
    csd
}

const fn build_csd0(c_size: u16, c_size_mult: u8, read_bl_len: u8) -> [u8; 16] {
    let mut csd = csd_common(0, read_bl_len);
    set_bits(c_size as u64, &mut csd, CSD_C_SIZE.0, CSD_C_SIZE.1);
    set_bits(0xfff, &mut csd, CSD_VDD_CURR.0, CSD_VDD_CURR.1);
    set_bits(c_size_mult as u64, &mut csd, CSD_C_SIZE_MULT.0, CSD_C_SIZE_MULT.1);
    let trailer = register_trailer(&csd);
    csd[15] = trailer;
    csd
}

const fn build_csd1(c_size: u32) -> [u8; 16] {
    let mut csd = csd_common(1, 9);
    set_bits(c_size as u64, &mut csd, CSD_C_SIZE_HC.0, CSD_C_SIZE_HC.1);
    let trailer = register_trailer(&csd);
    csd[15] = trailer;
    csd
}

const fn build_ssr() -> [u8; 64] {
    let mut ssr = [0u8; 64];
    // Speed class 2, 1-bit bus until ACMD6.
    set_bits(0x01, &mut ssr, SSR_SPEED_CLASS.0, SSR_SPEED_CLASS.1);
    ssr
}

// Identification register templates. Serial number and product name get
// patched at construction, the trailer is recomputed then too.
const CID_TOSHIBA16M: [u8; 16] = [
    0x02, 0x00, 0x00, 0x54, 0x42, 0x31, 0x36, 0x4d, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x32,
    0x01,
];
const CID_SANDISK64M: [u8; 16] = [
    0x03, 0x53, 0x44, 0x53, 0x55, 0x30, 0x36, 0x34, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x45,
    0x01,
];
const CID_TRANSCEND1G: [u8; 16] = [
    0x1d, 0x41, 0x44, 0x54, 0x53, 0x30, 0x31, 0x47, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00, 0x76,
    0x01,
];
const CID_SANDISK4G: [u8; 16] = [
    0x03, 0x53, 0x44, 0x53, 0x55, 0x30, 0x34, 0x47, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x87,
    0x01,
];
const CID_AUTO: [u8; 16] = [
    0xff, 0x00, 0x00, 0x56, 0x43, 0x41, 0x52, 0x44, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0xe1,
    0x01,
];

// SD spec v2, erased data reads 0xff, no security, 1-and-4-bit interface.
const SCR_SD: [u8; 8] = [0x02, 0x85, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

const SSR_SD: [u8; 64] = build_ssr();

/// Immutable template a live card is constructed from.
#[derive(Clone)]
pub struct CardSpec {
    pub name: &'static str,
    pub family: CardFamily,
    /// Power-up latency in simulated microseconds; SEND_OP_COND reports
    /// busy until this much time has passed since the first attempt.
    pub reset_latency_us: u64,
    /// OCR template without the dynamic power-up/capacity bits.
    pub ocr: u32,
    pub cid: [u8; 16],
    pub csd: [u8; 16],
    pub scr: [u8; 8],
    pub ssr: [u8; 64],
    /// Seed for the RCA published by CMD3; host-assigned when `None`.
    pub initial_rca: Option<u16>,
    /// Encode the backing-store size into the CSD at construction instead
    /// of trusting the template's capacity fields.
    pub auto_capacity: bool,
}

pub static CARD_SPECS: &[CardSpec] = &[
    CardSpec {
        name: "Toshiba16M",
        family: CardFamily::Mmc,
        reset_latency_us: 2_000,
        ocr: OCR_VOLTAGE_WINDOW,
        cid: CID_TOSHIBA16M,
        csd: build_csd0(63, 7, 9), // 32768 x 512 = 16 MiB
        scr: [0u8; 8],
        ssr: [0u8; 64],
        initial_rca: None,
        auto_capacity: false,
    },
    CardSpec {
        name: "SanDisk64M",
        family: CardFamily::Sd,
        reset_latency_us: 5_000,
        ocr: OCR_VOLTAGE_WINDOW,
        cid: CID_SANDISK64M,
        csd: build_csd0(255, 7, 9), // 131072 x 512 = 64 MiB
        scr: SCR_SD,
        ssr: SSR_SD,
        initial_rca: Some(0xe624),
        auto_capacity: false,
    },
    CardSpec {
        name: "Transcend1G",
        family: CardFamily::Sd,
        reset_latency_us: 5_000,
        ocr: OCR_VOLTAGE_WINDOW,
        cid: CID_TRANSCEND1G,
        csd: build_csd0(2047, 7, 10), // 1048576 x 1024 = 1 GiB
        scr: SCR_SD,
        ssr: SSR_SD,
        initial_rca: Some(0x85aa),
        auto_capacity: false,
    },
    CardSpec {
        name: "SanDisk4G",
        family: CardFamily::Sd,
        reset_latency_us: 8_000,
        ocr: OCR_VOLTAGE_WINDOW,
        cid: CID_SANDISK4G,
        csd: build_csd1(8191), // 8192 x 512 KiB = 4 GiB
        scr: SCR_SD,
        ssr: SSR_SD,
        initial_rca: Some(0x1b6a),
        auto_capacity: false,
    },
    CardSpec {
        name: "auto_mmc",
        family: CardFamily::Mmc,
        reset_latency_us: 1_000,
        ocr: OCR_VOLTAGE_WINDOW,
        cid: CID_AUTO,
        csd: build_csd0(0, 0, 9),
        scr: [0u8; 8],
        ssr: [0u8; 64],
        initial_rca: None,
        auto_capacity: true,
    },
    CardSpec {
        name: "auto_sd",
        family: CardFamily::Sd,
        reset_latency_us: 1_000,
        ocr: OCR_VOLTAGE_WINDOW,
        cid: CID_AUTO,
        csd: build_csd0(0, 0, 9),
        scr: SCR_SD,
        ssr: SSR_SD,
        initial_rca: Some(0xa55a),
        auto_capacity: true,
    },
    CardSpec {
        name: "auto_mmcplus",
        family: CardFamily::MmcPlus,
        reset_latency_us: 1_000,
        ocr: OCR_VOLTAGE_WINDOW,
        cid: CID_AUTO,
        csd: build_csd1(0),
        scr: [0u8; 8],
        ssr: [0u8; 64],
        initial_rca: None,
        auto_capacity: true,
    },
];

/// Look up a template by product name.
pub fn lookup(product: &str) -> Option<&'static CardSpec> {
    CARD_SPECS.iter().find(|spec| spec.name == product)
}

/// Whether the CSD declares the sector-addressed layout (structure 1).
pub(crate) fn is_high_capacity(csd: &[u8; 16]) -> bool {
    get_bits(csd, CSD_STRUCTURE.0, CSD_STRUCTURE.1) == 1
}

/// Derive `(capacity, block length)` from the CSD capacity fields.
pub fn decode_capacity(csd: &[u8; 16]) -> Result<(u64, u32), ModelError> {
    match get_bits(csd, CSD_STRUCTURE.0, CSD_STRUCTURE.1) {
        0 => {
            let blocklen = 1u32 << get_bits(csd, CSD_READ_BL_LEN.0, CSD_READ_BL_LEN.1);
            let c_size = get_bits(csd, CSD_C_SIZE.0, CSD_C_SIZE.1);
            let mult = get_bits(csd, CSD_C_SIZE_MULT.0, CSD_C_SIZE_MULT.1);
            let blocks = (c_size + 1) << (mult + 2);
            Ok((blocks * u64::from(blocklen), blocklen))
        }
        1 => {
            let c_size = get_bits(csd, CSD_C_SIZE_HC.0, CSD_C_SIZE_HC.1);
            Ok(((c_size + 1) * 512 * 1024, 512))
        }
        structure => Err(ModelError::UnsupportedCsdStructure(structure as u8)),
    }
}

/// Encode `size` into the CSD capacity fields, honoring the template's
/// structure version, and refresh the register trailer.
pub fn encode_capacity(csd: &mut [u8; 16], size: u64) -> Result<(), ModelError> {
    match get_bits(csd, CSD_STRUCTURE.0, CSD_STRUCTURE.1) {
        0 => encode_capacity_legacy(csd, size)?,
        1 => encode_capacity_hc(csd, size)?,
        structure => return Err(ModelError::UnsupportedCsdStructure(structure as u8)),
    }
    csd[15] = register_trailer(csd);
    Ok(())
}

/// Structure 0: search for a block-length / multiplier / block-count
/// factorization fitting the 12-bit C_SIZE and 3-bit C_SIZE_MULT fields.
fn encode_capacity_legacy(csd: &mut [u8; 16], size: u64) -> Result<(), ModelError> {
    for bl_exp in 9..=11u32 {
        let blocklen = 1u64 << bl_exp;
        if size == 0 || size % blocklen != 0 {
            continue;
        }
        let blocks = size / blocklen;
        for mult in (0..=7u64).rev() {
            let per_unit = 1u64 << (mult + 2);
            if blocks % per_unit != 0 {
                continue;
            }
            let units = blocks / per_unit;
            if units == 0 || units > 4096 {
                continue;
            }
            set_bits(units - 1, csd, CSD_C_SIZE.0, CSD_C_SIZE.1);
            set_bits(mult, csd, CSD_C_SIZE_MULT.0, CSD_C_SIZE_MULT.1);
            set_bits(u64::from(bl_exp), csd, CSD_READ_BL_LEN.0, CSD_READ_BL_LEN.1);
            set_bits(u64::from(bl_exp), csd, CSD_WRITE_BL_LEN.0, CSD_WRITE_BL_LEN.1);
            return Ok(());
        }
    }
    Err(ModelError::UnrepresentableCapacity { size })
}

/// Structure 1: flat 22-bit count of 512 KiB units.
fn encode_capacity_hc(csd: &mut [u8; 16], size: u64) -> Result<(), ModelError> {
    const UNIT: u64 = 512 * 1024;
    if size == 0 || size % UNIT != 0 || size / UNIT > 1 << 22 {
        return Err(ModelError::UnrepresentableCapacity { size });
    }
    set_bits(size / UNIT - 1, csd, CSD_C_SIZE_HC.0, CSD_C_SIZE_HC.1);
    Ok(())
}

/// Patch a capacity-class label and a per-card serial into the CID and
/// refresh its trailer. Purely for diagnostics: two mounted images with the
/// same template still log distinguishably.
pub fn patch_cid(cid: &mut [u8; 16], name: &str, instance: u32, capacity: u64) {
    let label = capacity_label(capacity);
    let mut pnm = [b' '; 5];
    for (i, b) in label.bytes().take(5).enumerate() {
        pnm[i] = b;
    }
    let mut packed = 0u64;
    for b in pnm {
        packed = packed << 8 | u64::from(b);
    }
    set_bits(packed, cid, CID_PNM.0, CID_PNM.1);
    set_bits(u64::from(serial_hash(name, instance)), cid, CID_PSN.0, CID_PSN.1);
    let trailer = register_trailer(cid);
    cid[15] = trailer;
}

/// Next per-process card instance number, fed into the CID serial so cards
/// built from the same template get distinct serials.
pub(crate) fn next_instance() -> u32 {
    static NEXT_INSTANCE: AtomicU32 = AtomicU32::new(0);
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

fn capacity_label(capacity: u64) -> String {
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;
    if capacity >= GIB && capacity % GIB == 0 {
        format!("{}G", capacity / GIB)
    } else if capacity >= MIB {
        format!("{}M", capacity / MIB)
    } else {
        format!("{}K", capacity >> 10)
    }
}

fn serial_hash(name: &str, instance: u32) -> u32 {
    let mut hash = 5381u32;
    for b in name.bytes().chain(instance.to_be_bytes()) {
        hash = hash.wrapping_mul(33) ^ u32::from(b);
    }
    hash
}

#[test]
fn test_template_capacities() {
    let expect: &[(&str, u64, u32)] = &[
        ("Toshiba16M", 16 << 20, 512),
        ("SanDisk64M", 64 << 20, 512),
        ("Transcend1G", 1 << 30, 1024),
        ("SanDisk4G", 4 << 30, 512),
    ];
    for &(name, capacity, blocklen) in expect {
        let spec = lookup(name).unwrap();
        assert_eq!(decode_capacity(&spec.csd).unwrap(), (capacity, blocklen), "{name}");
    }
}

#[test]
fn test_encode_decode_round_trip() {
    for size in [16u64 << 20, 64 << 20, 256 << 20, 1 << 30, 2 << 30] {
        let mut csd = build_csd0(0, 0, 9);
        encode_capacity(&mut csd, size).unwrap();
        assert_eq!(decode_capacity(&csd).unwrap().0, size, "csd0 {size}");
    }
    for size in [1u64 << 30, 4 << 30, 32 << 30] {
        let mut csd = build_csd1(0);
        encode_capacity(&mut csd, size).unwrap();
        assert_eq!(decode_capacity(&csd).unwrap(), (size, 512), "csd1 {size}");
    }
}

#[test]
fn test_encode_rejects_unrepresentable() {
    let mut csd = build_csd0(0, 0, 9);
    // Not a multiple of any valid block length.
    assert!(encode_capacity(&mut csd, 1000).is_err());
    // Exceeds the 12-bit/3-bit field product.
    assert!(encode_capacity(&mut csd, 8 << 30).is_err());

    let mut csd = build_csd1(0);
    // Not 512 KiB aligned.
    assert!(encode_capacity(&mut csd, (512 << 10) + 512).is_err());
    assert!(encode_capacity(&mut csd, 0).is_err());
}

#[test]
fn test_patch_cid() {
    let mut cid = CID_AUTO;
    patch_cid(&mut cid, "auto_sd", 3, 64 << 20);
    assert_eq!(get_bits(&cid, CID_PSN.0, CID_PSN.1) as u32, serial_hash("auto_sd", 3));
    // "64M  " in the product-name field.
    assert_eq!(&cid[3..8], b"64M  ");
    assert_eq!(cid[15], register_trailer(&cid));
    assert_eq!(cid[15] & 1, 1);

    // Same template, different instance: the serial must differ.
    let mut other = CID_AUTO;
    patch_cid(&mut other, "auto_sd", 4, 64 << 20);
    assert_ne!(
        get_bits(&cid, CID_PSN.0, CID_PSN.1),
        get_bits(&other, CID_PSN.0, CID_PSN.1)
    );
}

#[test]
fn test_template_trailers_valid() {
    for spec in CARD_SPECS {
        assert_eq!(spec.csd[15], register_trailer(&spec.csd), "{}", spec.name);
    }
}
