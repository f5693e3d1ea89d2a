//! # amspatch
//!
//! A patcher for the AMS operating system of TI-68k graphing calculators
//! (TI-89, TI-92 Plus, Voyage 200, TI-89 Titanium).
//!
//! ## Overview
//!
//! AMS update files carry a signed basecode whose entry points are only
//! reachable through indirection: the ROM_CALL table, the exception
//! vectors, trap dispatch tables and the attribute table of the system
//! frame. This crate:
//!
//! 1. Parses the `**TIFL**` container and checks the basecode size
//! 2. Derives the ROM base from the ROM_CALL table pointer
//! 3. Locates patch sites through the indirection layers and byte signatures
//! 4. Rewrites them with hand-assembled 68000 code
//! 5. Recomputes the basecode checksum and, for oversized releases, shrinks
//!    the image
//!
//! The patched basecode is no longer signed and is meant for calculators
//! running a boot loader that does not check the signature.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod address;
pub mod container;
pub mod context;
pub mod encode;
pub mod error;
pub mod firmware;
pub mod fixup;
pub mod image;
pub mod integrity;
pub mod patcher;
pub mod resolver;
pub mod scanner;
pub mod stages;

pub use address::AddressSpace;
pub use container::{Container, SizePolicy};
pub use context::EngineContext;
pub use error::{Error, ErrorKind, Result};
pub use firmware::{CalculatorModel, Features, FirmwareInfo, OsVersion};
pub use image::Image;
pub use integrity::{ChecksumRecord, IntegrityLedger};
pub use patcher::{
    patch_file, PatchConfig, PatchOutput, PatchReport, Patcher, ProgressCallback, ProgressInfo,
    ProgressStage,
};
pub use scanner::{SignatureScanner, Width};
pub use stages::{FailurePolicy, PatchStage, Patchset, StageOutcome, StageReport};
