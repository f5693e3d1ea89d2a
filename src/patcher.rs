//! Patch pipeline.
//!
//! This module ties the pieces together:
//! 1. Walk the container header and check the basecode size
//! 2. Bind the image to its address space
//! 3. Verify the basecode checksum
//! 4. Run the selected patchset's stages in order
//! 5. Commit length fields, checksum and container size
//!
//! Everything happens on an in-memory copy. The output file is created only
//! after the whole run succeeded.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use tracing::{debug, info};

use crate::container::Container;
use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::firmware::{Features, FirmwareInfo};
use crate::image::Image;
use crate::integrity::{ChecksumRecord, IntegrityLedger};
use crate::stages::{run_stage, Patchset, StageOutcome, StageReport};

/// Progress stage during a patch run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    Validating,
    Patching,
    Committing,
    WritingFile,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validating => "Validating",
            Self::Patching => "Patching",
            Self::Committing => "Updating checksum",
            Self::WritingFile => "Writing file",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during a patch run.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    pub stage: ProgressStage,
    /// Name of the patch stage being run.
    pub current_item: Option<String>,
    pub current: usize,
    pub total: usize,
    /// Sites modified so far.
    pub sites_patched: usize,
    /// Size of the image being patched.
    pub total_bytes: usize,
}

impl Default for ProgressInfo {
    fn default() -> Self {
        Self {
            stage: ProgressStage::Validating,
            current_item: None,
            current: 0,
            total: 0,
            sites_patched: 0,
            total_bytes: 0,
        }
    }
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Configuration for a patch run.
pub struct PatchConfig {
    pub patchset: Patchset,
    pub features: Features,
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for PatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchConfig")
            .field("patchset", &self.patchset)
            .field("features", &self.features)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            patchset: Patchset::Full,
            features: Features::default(),
            progress_callback: None,
        }
    }
}

impl PatchConfig {
    /// Configuration for the lighter fix-only patchset.
    pub fn fix_only() -> Self {
        Self {
            patchset: Patchset::Fix,
            ..Default::default()
        }
    }

    fn report(&self, progress: &ProgressInfo) {
        if let Some(ref cb) = self.progress_callback {
            cb(progress);
        }
    }
}

/// What a run did.
#[derive(Clone, Debug)]
pub struct PatchReport {
    pub firmware: FirmwareInfo,
    pub stages: Vec<StageReport>,
    pub checksum_before: ChecksumRecord,
    pub checksum_after: ChecksumRecord,
    /// Bytes removed from the end of the basecode.
    pub shrunk_by: u32,
    /// Length of the patched file.
    pub final_len: usize,
}

impl PatchReport {
    /// Total number of sites all applied stages reported.
    pub fn sites_patched(&self) -> usize {
        self.stages
            .iter()
            .map(|r| match &r.outcome {
                StageOutcome::Applied { sites } => sites.len(),
                _ => 0,
            })
            .sum()
    }
}

/// Patched bytes with their report.
#[derive(Debug)]
pub struct PatchOutput {
    pub bytes: Vec<u8>,
    pub report: PatchReport,
}

/// An OS update file ready to be patched.
pub struct Patcher {
    container: Container,
    bytes: Vec<u8>,
}

impl Patcher {
    /// Parse the container header. Bytes past the end signature are dropped.
    pub fn new(mut bytes: Vec<u8>) -> Result<Self> {
        let container = Container::parse(&bytes)?;
        let len = container.image_len();
        if bytes.len() < len {
            return Err(Error::Format(format!(
                "file holds {} bytes but the header declares {}",
                bytes.len(),
                len
            )));
        }
        bytes.truncate(len);

        debug!(
            "{} basecode, release code {}, 0x{:X} bytes at offset {}",
            container.model, container.version_code, container.basecode_size, container.head
        );
        Ok(Self { container, bytes })
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Check the basecode size against the selected patchset's policy.
    pub fn validate(&self, config: &PatchConfig) -> Result<()> {
        self.container
            .validate_size(config.patchset.size_policy())
    }

    /// Run the patchset and return the patched bytes.
    pub fn run(self, config: &PatchConfig) -> Result<PatchOutput> {
        let mut progress = ProgressInfo {
            total_bytes: self.bytes.len(),
            ..Default::default()
        };
        config.report(&progress);

        let mut ctx = EngineContext::open(
            Image::new(self.bytes),
            self.container.head,
            self.container.model,
            self.container.version_code,
            config.features,
        )?;
        let (ledger, checksum_before) = IntegrityLedger::open(&mut ctx)?;
        info!(
            "{} AMS {} (release code {})",
            ctx.firmware().model,
            ctx.firmware().os,
            ctx.firmware().version_code
        );

        let stages = config.patchset.stages();
        progress.stage = ProgressStage::Patching;
        progress.total = stages.len();

        let mut reports = Vec::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            progress.current = i;
            progress.current_item = Some(stage.name().to_string());
            config.report(&progress);

            let report = run_stage(stage.as_ref(), &mut ctx)?;
            if let StageOutcome::Applied { sites } = &report.outcome {
                progress.sites_patched += sites.len();
            }
            reports.push(report);
        }

        progress.stage = ProgressStage::Committing;
        progress.current = progress.total;
        progress.current_item = None;
        config.report(&progress);
        let checksum_after = ledger.commit(&mut ctx)?;

        let firmware = *ctx.firmware();
        let shrunk_by = ctx.shrunk_by();
        let bytes = ctx.into_image().into_bytes();

        Ok(PatchOutput {
            report: PatchReport {
                firmware,
                stages: reports,
                checksum_before,
                checksum_after,
                shrunk_by,
                final_len: bytes.len(),
            },
            bytes,
        })
    }
}

/// Patch `input` into a new file at `output`.
///
/// Fails with [`Error::OutputExists`] before reading anything if `output`
/// is already there. No file is created unless every stage succeeded.
pub fn patch_file<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    output: Q,
    config: &PatchConfig,
) -> Result<PatchReport> {
    let output = output.as_ref();
    if output.exists() {
        return Err(Error::OutputExists(output.to_path_buf()));
    }

    let patcher = Patcher::new(std::fs::read(input.as_ref())?)?;
    patcher.validate(config)?;
    let PatchOutput { bytes, report } = patcher.run(config)?;

    let mut progress = ProgressInfo {
        stage: ProgressStage::WritingFile,
        current: 0,
        total: bytes.len(),
        sites_patched: report.sites_patched(),
        total_bytes: bytes.len(),
        current_item: None,
    };
    config.report(&progress);

    write_output(output, &bytes)?;

    progress.stage = ProgressStage::Complete;
    progress.current = progress.total;
    config.report(&progress);

    Ok(report)
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::OutputCreationFailed(e.to_string()))?;

    file.write_all(data)
        .map_err(|e| Error::OutputWriteFailed(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_config_default() {
        let config = PatchConfig::default();
        assert_eq!(config.patchset, Patchset::Full);
        assert!(config.features.hardcode_fonts);
        assert!(!config.features.hardcode_english_language);
        assert!(config.progress_callback.is_none());
    }

    #[test]
    fn test_patch_config_fix_only() {
        let config = PatchConfig::fix_only();
        assert_eq!(config.patchset, Patchset::Fix);
    }

    #[test]
    fn test_progress_stage_names() {
        assert_eq!(ProgressStage::Validating.name(), "Validating");
        assert_eq!(ProgressStage::Complete.name(), "Complete");
    }

    #[test]
    fn test_rejects_non_container() {
        assert!(matches!(
            Patcher::new(b"not an OS image".to_vec()),
            Err(Error::Format(_))
        ));
    }
}
