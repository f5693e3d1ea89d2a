//! End-to-end tests over synthetic OS images.
//!
//! The fixture is a TI-89 basecode with just enough of the OS laid out for
//! every stage of the full patchset to find its target:
//! - ROM base 0x200000, basecode at file offset 78
//! - ROM_CALL table at 0x216000
//! - trap #9, #10 and #11 handlers with their tables
//! - the routines the unlock, optimize, fix and expand stages rewrite
//!
//! The rest of the image is zero.

use std::fs;

use amspatch::{
    patch_file, CalculatorModel, Error, PatchConfig, Patcher, Patchset, StageOutcome,
};

const HEAD: usize = 78;
const START: u32 = 0x212000;
const TABLE: u32 = 0x216000;
const ENTRIES: u32 = 0x5F0;

const SIZE_205: u32 = 0x124772;
const SIZE_208: u32 = 0x12E01A;

// ROM_CALL ids used by the fixture.
const EX_STO_BCD: i32 = 0x0C0;
const HEAP_DEREF: i32 = 0x096;
const OS_REGISTER_TIMER: i32 = 0x0F0;
const DRAW_CHAR: i32 = 0x1A4;
const MEMCMP: i32 = 0x270;
const OSV_REGISTER_TIMER: i32 = 0x284;
const OSV_FREE_TIMER: i32 = 0x285;
const XR_STRING_PTR: i32 = 0x293;
const OS_CONTRAST_UP: i32 = 0x296;
const OS_CONTRAST_DN: i32 = 0x297;
const EM_GET_ARCHIVE_MEMORY_BEGINNING: i32 = 0x3CF;
const RELEASE_VERSION: i32 = 0x440;
const HEAP_TABLE: i32 = 0x441;
const SF_WIDTH: i32 = 0x4D3;
const FIFTY_MSEC_TICK: i32 = 0x4FC;

// Vector slots.
const AUTO_INT_5: u32 = 0x74;
const TRAP_3: u32 = 0x8C;
const TRAP_9: u32 = 0xA4;
const TRAP_10: u32 = 0xA8;
const TRAP_11: u32 = 0xAC;
const ROM_CALL_TABLE: u32 = 0xC8;

const EX_STO_BCD_ADDR: u32 = 0x21A400;

/// Synthetic update file.
struct Fixture {
    bytes: Vec<u8>,
    size: u32,
}

fn offset(addr: u32) -> usize {
    (addr - START) as usize + HEAD
}

impl Fixture {
    fn new(model: u8, version_code: u8, size: u32, release: &[u8; 4]) -> Self {
        let mut bytes = vec![0u8; HEAD + size as usize + 73];
        bytes[..8].copy_from_slice(b"**TIFL**");
        bytes[0x11..0x19].copy_from_slice(b"basecode");
        bytes[HEAD] = 0x80;
        bytes[HEAD + 1] = 0x0F;
        bytes[HEAD + 2..HEAD + 6].copy_from_slice(&size.to_be_bytes());
        bytes[HEAD + 8] = model;
        bytes[HEAD + 11] = version_code;
        let product = b"Advanced Mathematics Software";
        bytes[HEAD + 0x16..HEAD + 0x16 + product.len()].copy_from_slice(product);

        let mut fixture = Self { bytes, size };
        fixture.lay_out_os(release);
        fixture
    }

    fn put_u16(&mut self, addr: u32, value: u16) {
        let at = offset(addr);
        self.bytes[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, addr: u32, value: u32) {
        let at = offset(addr);
        self.bytes[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn set_vector(&mut self, slot: u32, value: u32) {
        self.put_u32(START + 0x88 + slot, value);
    }

    fn set_rom_call(&mut self, id: i32, value: u32) {
        self.put_u32((TABLE as i64 + 4 * id as i64) as u32, value);
    }

    fn lay_out_os(&mut self, release: &[u8; 4]) {
        self.set_vector(ROM_CALL_TABLE, TABLE);
        self.set_rom_call(-1, ENTRIES);
        self.set_rom_call(RELEASE_VERSION, 0x217F00);
        let at = offset(0x217F00);
        self.bytes[at..at + 4].copy_from_slice(release);

        // RAM execution protection.
        self.set_rom_call(EX_STO_BCD, EX_STO_BCD_ADDR);
        for off in [0x58, 0x5C, 0x62, 0x68] {
            self.put_u16(EX_STO_BCD_ADDR + off, 0x6600);
        }

        // Flash execution protection and the trap #11 table.
        self.put_u32(0x212300, 0x0070_0012);
        self.set_vector(TRAP_11, 0x218000);
        self.put_u16(0x21800E, 0x01F2);
        self.put_u32(0x218010, 0xC6FC_0006);
        self.put_u16(0x218020, 0x4E68);
        self.put_u32(0x218200 + 6 * 0x10, 0x218800);

        // Archive memory limit.
        self.set_rom_call(EM_GET_ARCHIVE_MEMORY_BEGINNING, 0x218400);
        self.put_u32(0x218410, 0xFFFF_0000);

        // FlashApp signature check.
        self.set_rom_call(XR_STRING_PTR, 0x219000);
        self.set_rom_call(MEMCMP, 0x219100);
        self.put_u16(0x2200F8, 0x0308);
        self.put_u32(0x220100, 0x0000_020E);
        self.put_u16(0x220104, 0x4EB9);
        self.put_u32(0x220106, 0x219000);
        self.put_u16(0x22041C, 0x6700);
        self.put_u32(0x220420, 0x219100);

        // ASM size limit and 'Invalid Program Reference' throws.
        let asm = if &release[2..] == b"05" { 0x0C52_6000 } else { 0x0C53_6000 };
        self.put_u32(0x222000, asm);
        for addr in [0x223000, 0x223010, 0x223020] {
            self.put_u16(addr, 0xA244);
        }

        self.set_rom_call(HEAP_DEREF, 0x219200);
        self.put_u16(0x21920A, 0x5D42);
        self.set_rom_call(HEAP_TABLE, 0x5D42);

        // Fonts through the system frame.
        self.set_vector(TRAP_10, 0x219E00);
        self.put_u32(0x219E0A, 0x21A000);
        self.put_u32(0x21A00E, 2);
        for (i, (key, value)) in [(0x300, 0x230000), (0x301, 0x231000), (0x302, 0x232000)]
            .into_iter()
            .enumerate()
        {
            self.put_u32(0x21A012 + 8 * i as u32, key);
            self.put_u32(0x21A016 + 8 * i as u32, value);
        }
        self.set_rom_call(DRAW_CHAR, 0x219300);
        self.put_u16(0x219326, 0x02DA);
        self.set_rom_call(SF_WIDTH, 0x219800);

        // OSContrastUp/Dn.
        self.set_rom_call(OS_CONTRAST_UP, 0x219A00);
        self.set_rom_call(OS_CONTRAST_DN, 0x219A40);
        self.put_u16(0x219A00, 0x48A7);
        self.put_u16(0x219A40, 0x48A7);
        self.put_u16(0x219A50, 0x4C9F);
        self.put_u16(0x219A58, 0x48A7);

        // Auto-int 5 and the timer tables.
        self.set_vector(AUTO_INT_5, 0x219B00);
        self.put_u32(0x219B00, 0x48E7_C0C0);
        self.put_u32(0x219B1C, 0x4CDF_0303);
        self.put_u16(0x219B20, 0x4E73);
        self.set_vector(TRAP_9, 0x219C80);
        self.put_u32(0x219C82, 0x219CA0);
        self.put_u32(0x219CAC, 0x5C00);
        self.put_u32(0x219CB0, 0x4C00);
        self.set_rom_call(FIFTY_MSEC_TICK, 0x7A20);
        self.set_rom_call(OS_REGISTER_TIMER, 0x219C40);
        self.put_u16(0x219C00, 0x48E7);
    }

    /// Store a valid basecode checksum.
    fn seal(mut self) -> Vec<u8> {
        let len = self.size as usize + 2;
        let sum = word_sum(&self.bytes[HEAD..HEAD + len]);
        self.bytes[HEAD + len..HEAD + len + 4].copy_from_slice(&sum.to_be_bytes());
        self.bytes
    }
}

fn word_sum(bytes: &[u8]) -> u32 {
    bytes
        .chunks_exact(2)
        .fold(0u32, |s, w| s.wrapping_add(u16::from_be_bytes([w[0], w[1]]) as u32))
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap())
}

/// Check the stored checksum of a patched file against its contents.
fn assert_sealed(bytes: &[u8]) {
    let len = be_u32(bytes, HEAD + 2) as usize + 2;
    assert_eq!(be_u32(bytes, HEAD + len), word_sum(&bytes[HEAD..HEAD + len]));
}

fn image_205() -> Vec<u8> {
    Fixture::new(3, 9, SIZE_205, b"2.05").seal()
}

fn outcome<'a>(report: &'a amspatch::PatchReport, name: &str) -> &'a StageOutcome {
    &report
        .stages
        .iter()
        .find(|s| s.name == name)
        .unwrap()
        .outcome
}

#[test]
fn test_full_pipeline() {
    let input = image_205();
    let patcher = Patcher::new(input.clone()).unwrap();
    let config = PatchConfig::default();
    patcher.validate(&config).unwrap();
    let output = patcher.run(&config).unwrap();

    let bytes = &output.bytes;
    let report = &output.report;
    assert_eq!(bytes.len(), input.len());
    assert_eq!(report.final_len, input.len());
    assert_eq!(report.shrunk_by, 0);
    assert_eq!(report.firmware.model, CalculatorModel::Ti89);
    assert_eq!(report.stages.len(), 15);

    assert!(report.checksum_before.is_valid());
    assert!(report.checksum_after.is_valid());
    assert_ne!(report.checksum_before.stored_value, report.checksum_after.stored_value);
    assert_sealed(bytes);

    for off in [0x58, 0x5C, 0x62, 0x68] {
        let at = offset(EX_STO_BCD_ADDR + off);
        assert_eq!(&bytes[at..at + 2], &[0, 0]);
    }
    assert_eq!(be_u32(bytes, offset(START + 0x88 + TRAP_3)), 0x213100);
    assert_eq!(be_u32(bytes, offset(TABLE + 4 * OSV_REGISTER_TIMER as u32)), 0x213140);
    assert_eq!(be_u32(bytes, offset(TABLE + 4 * OSV_FREE_TIMER as u32)), 0x213170);

    assert!(outcome(report, "unsigned-apps").is_applied());
    assert!(outcome(report, "contrast-registers").is_applied());
    assert_eq!(outcome(report, "shrink"), &StageOutcome::NotApplicable);
    assert_eq!(outcome(report, "english-language"), &StageOutcome::NotApplicable);
}

#[test]
fn test_fix_patchset() {
    let input = image_205();
    let config = PatchConfig::fix_only();
    let patcher = Patcher::new(input.clone()).unwrap();
    patcher.validate(&config).unwrap();
    let output = patcher.run(&config).unwrap();

    assert_eq!(output.report.stages.len(), 8);
    assert_eq!(output.bytes.len(), input.len());
    assert_sealed(&output.bytes);

    // No trap #3 handler, and the stealth port writes are left out.
    assert_eq!(be_u32(&output.bytes, offset(START + 0x88 + TRAP_3)), 0);
    let at = offset(0x212304 - 26);
    assert_eq!(&output.bytes[at..at + 2], &[0, 0]);
}

#[test]
fn test_patch_file_writes_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ti89.89u");
    let output = dir.path().join("patched.89u");
    fs::write(&input, image_205()).unwrap();

    let report = patch_file(&input, &output, &PatchConfig::default()).unwrap();
    let written = fs::read(&output).unwrap();
    assert_eq!(written.len(), report.final_len);
    assert_sealed(&written);
}

#[test]
fn test_trailing_bytes_dropped() {
    let mut input = image_205();
    let len = input.len();
    input.extend_from_slice(&[0xAA; 16]);

    let output = Patcher::new(input).unwrap().run(&PatchConfig::default()).unwrap();
    assert_eq!(output.bytes.len(), len);
}

#[test]
fn test_rejects_non_tifl_input() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("notes.txt");
    let output = dir.path().join("out.89u");
    fs::write(&input, b"this is not an OS update").unwrap();

    let err = patch_file(&input, &output, &PatchConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Format(_)));
    assert_eq!(err.exit_code(), 3);
    assert!(!output.exists());
}

#[test]
fn test_rejects_corrupt_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ti89.89u");
    let output = dir.path().join("out.89u");
    let mut bytes = image_205();
    bytes[offset(0x300000)] ^= 0x40;
    fs::write(&input, bytes).unwrap();

    let err = patch_file(&input, &output, &PatchConfig::default()).unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }));
    assert_eq!(err.exit_code(), 9);
    assert!(!output.exists());
}

#[test]
fn test_refuses_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ti89.89u");
    let output = dir.path().join("out.89u");
    fs::write(&input, image_205()).unwrap();
    fs::write(&output, b"keep me").unwrap();

    let err = patch_file(&input, &output, &PatchConfig::default()).unwrap_err();
    assert!(matches!(err, Error::OutputExists(_)));
    assert_eq!(fs::read(&output).unwrap(), b"keep me");
}

#[test]
fn test_size_mismatch() {
    let bytes = Fixture::new(3, 9, SIZE_205 - 2, b"2.05").seal();
    let patcher = Patcher::new(bytes).unwrap();
    let err = patcher.validate(&PatchConfig::default()).unwrap_err();
    assert!(matches!(err, Error::SizeMismatch { .. }));
    // The fix patchset only checks the size window.
    assert!(patcher.validate(&PatchConfig::fix_only()).is_ok());
}

/// 2.08 image whose tail matches the relocation table.
fn image_208() -> Vec<u8> {
    let mut fixture = Fixture::new(3, 11, SIZE_208, b"2.08");
    let refs: [(u32, u32); 6] = [
        (0x237362, 0x33FEE0),
        (0x2A8B06, 0x33FEF4),
        (0x2B97E8, 0x33FF2A),
        (0x2B97EC, 0x33FF34),
        (0x2B97F0, 0x33FF3E),
        (0x2A8AEE, 0x33FF3E),
    ];
    for (location, value) in refs {
        fixture.put_u32(location, value);
    }
    // Every other location of the table.
    let rest: [(u32, u32); 15] = [
        (0x237368, 0x33FEEA),
        (0x2A8B1C, 0x33FF0E),
        (0x2A8B32, 0x33FF16),
        (0x2A8B48, 0x33FF20),
        (0x2B97F8, 0x33FF48),
        (0x2B97F4, 0x33FF52),
        (0x2A8B5C, 0x33FF5C),
        (0x2A8B76, 0x33FFA0),
        (0x2B97FC, 0x33FFAC),
        (0x2B9800, 0x33FFBC),
        (0x2B9804, 0x33FFCC),
        (0x2B9808, 0x33FFDC),
        (0x2B980C, 0x33FFEC),
        (0x33FEE0, 0xB17B_17B1),
        (0x33FFFC, 0x0303_0303),
    ];
    for (location, value) in rest {
        fixture.put_u32(location, value);
    }
    fixture.seal()
}

#[test]
fn test_shrink_208() {
    let input = image_208();
    let patcher = Patcher::new(input.clone()).unwrap();
    let config = PatchConfig::default();
    patcher.validate(&config).unwrap();
    let output = patcher.run(&config).unwrap();

    let bytes = &output.bytes;
    assert!(outcome(&output.report, "shrink").is_applied());
    assert_eq!(output.report.shrunk_by, 316);
    assert_eq!(bytes.len(), input.len() - 316);

    // Both length fields and the container size follow the new length.
    assert_eq!(be_u32(bytes, HEAD + 2), SIZE_208 - 316);
    assert_eq!(be_u32(bytes, HEAD + 0x80), SIZE_208 - 316 - 126);
    let size_field = u32::from_le_bytes(bytes[HEAD - 4..HEAD].try_into().unwrap());
    assert_eq!(size_field as usize, bytes.len() - HEAD);
    assert_sealed(bytes);

    // Relocated data and the rewritten pointers.
    assert_eq!(be_u32(bytes, offset(0x214000)), 0xB17B_17B1);
    assert_eq!(be_u32(bytes, offset(0x237362)), 0x214000);
    assert_eq!(be_u32(bytes, offset(0x2B97E8)), 0x214000);
    assert_eq!(be_u32(bytes, offset(0x2B97EC)), 0x21404A);
}
