//! The state shared by every patch stage.
//!
//! An [`EngineContext`] owns the image, knows where it sits in the
//! calculator's address space and offers address-based access on top of the
//! offset-based [`Image`] cursor. The indirection helpers (ROM_CALLs,
//! vectors, trap tables, attributes) live in [`crate::resolver`].

use tracing::debug;

use crate::address::AddressSpace;
use crate::error::Result;
use crate::firmware::{
    rom_call, vector, CalculatorModel, Features, FirmwareInfo, OsVersion, VECTOR_TABLE_OFFSET,
};
use crate::image::Image;
use crate::scanner::{SignatureScanner, Width};

/// Length of the `ReleaseVersion` prefix that encodes the version.
const RELEASE_VERSION_LEN: usize = 4;

pub struct EngineContext {
    image: Image,
    space: AddressSpace,
    firmware: FirmwareInfo,
    features: Features,
    scanner: SignatureScanner,
    pub(crate) dispatch_table: u32,
    pub(crate) dispatch_entries: u32,
    pub(crate) trap9_pointers: Option<u32>,
    pub(crate) trapb_functions: Option<u32>,
    pub(crate) system_frame: Option<u32>,
    shrunk_by: u32,
}

impl EngineContext {
    /// Bind an image whose basecode starts at file offset `head`.
    ///
    /// Reads the ROM_CALL table pointer from the vector table to derive the
    /// address space, then asks the OS for its release version.
    pub fn open(
        mut image: Image,
        head: u32,
        model: CalculatorModel,
        version_code: u8,
        features: Features,
    ) -> Result<Self> {
        image.seek((head + VECTOR_TABLE_OFFSET + vector::ROM_CALL_TABLE) as i64)?;
        let dispatch_table = image.read_u32()?;
        let space = AddressSpace::from_dispatch_pointer(dispatch_table, head);

        let mut ctx = Self {
            image,
            space,
            firmware: FirmwareInfo {
                model,
                version_code,
                os: OsVersion::new(0, 0),
            },
            features,
            scanner: SignatureScanner::default(),
            dispatch_table,
            dispatch_entries: 0,
            trap9_pointers: None,
            trapb_functions: None,
            system_frame: None,
            shrunk_by: 0,
        };

        ctx.dispatch_entries = ctx.rom_call(rom_call::ENTRY_COUNT)?;
        debug!(
            "ROM base 0x{:06X}, ROM_CALL table at 0x{:06X} with {} entries",
            space.base(),
            dispatch_table,
            ctx.dispatch_entries
        );

        let release = ctx.rom_call(rom_call::RELEASE_VERSION)?;
        let text = ctx.get_n(release, RELEASE_VERSION_LEN)?;
        ctx.firmware.os = OsVersion::parse(&text)?;

        Ok(ctx)
    }

    /// Replace the default unbounded scanner used by [`Self::scan_forward`]
    /// and [`Self::scan_backward`].
    pub fn with_scanner(mut self, scanner: SignatureScanner) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// Start of the Flash ROM.
    pub fn base(&self) -> u32 {
        self.space.base()
    }

    /// File offset of the first basecode byte.
    pub fn head(&self) -> u32 {
        self.space.head()
    }

    pub fn firmware(&self) -> &FirmwareInfo {
        &self.firmware
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut Image {
        &mut self.image
    }

    pub fn into_image(self) -> Image {
        self.image
    }

    /// Bytes removed from the end of the basecode by relocation.
    pub fn shrunk_by(&self) -> u32 {
        self.shrunk_by
    }

    pub(crate) fn record_shrink(&mut self, bytes: u32) {
        self.shrunk_by += bytes;
    }

    pub fn seek(&mut self, addr: u32) -> Result<()> {
        self.image.seek(self.space.to_offset(addr))
    }

    /// Address of the cursor.
    pub fn tell(&self) -> u32 {
        self.space.to_address(self.image.position() as i64)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.image.read_u16()
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.image.read_u32()
    }

    pub fn get_u16(&mut self, addr: u32) -> Result<u16> {
        self.seek(addr)?;
        self.image.read_u16()
    }

    pub fn get_u32(&mut self, addr: u32) -> Result<u32> {
        self.seek(addr)?;
        self.image.read_u32()
    }

    pub fn get_n(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        self.seek(addr)?;
        Ok(self.image.read_n(len)?.to_vec())
    }

    pub fn put_u16(&mut self, addr: u32, value: u16) -> Result<()> {
        self.seek(addr)?;
        self.image.write_u16(value)
    }

    pub fn put_u32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.seek(addr)?;
        self.image.write_u32(value)
    }

    pub fn put_n(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        self.seek(addr)?;
        self.image.write_n(bytes)
    }

    /// Forward search from the cursor; returns the address just past the match.
    pub fn scan_forward(&mut self, value: u32, width: Width) -> Result<u32> {
        let scanner = self.scanner;
        self.forward_with(scanner, value, width)
    }

    /// Forward search limited to `window` bytes from the cursor.
    pub fn scan_forward_within(&mut self, value: u32, width: Width, window: usize) -> Result<u32> {
        let scanner = SignatureScanner::new(window.min(self.scanner.window()));
        self.forward_with(scanner, value, width)
    }

    /// Backward search from the cursor; returns the address of the match.
    pub fn scan_backward(&mut self, value: u32, width: Width) -> Result<u32> {
        let scanner = self.scanner;
        self.backward_with(scanner, value, width)
    }

    fn forward_with(&mut self, scanner: SignatureScanner, value: u32, width: Width) -> Result<u32> {
        let end = scanner.forward(&mut self.image, value, width)?;
        Ok(self.space.to_address(end as i64))
    }

    fn backward_with(&mut self, scanner: SignatureScanner, value: u32, width: Width) -> Result<u32> {
        let at = scanner.backward(&mut self.image, value, width)?;
        Ok(self.space.to_address(at as i64))
    }
}
