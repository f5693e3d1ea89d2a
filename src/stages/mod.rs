//! Patch stages and the patchsets that order them.
//!
//! A stage locates its target through the resolver and the scanner, reads
//! everything it needs, assembles the replacement and only then writes.
//! Fatal stages abort the run on any error. Best-effort stages log and skip
//! when their target cannot be found, which is the expected outcome on OS
//! builds that never had the defect.

use tracing::{debug, info, warn};

use crate::container::SizePolicy;
use crate::context::EngineContext;
use crate::error::Result;

pub mod expand;
pub mod fix;
pub mod optimize;
pub mod shrink;
pub mod unlock;

/// What happens when a stage fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the whole run.
    Fatal,
    /// Log, leave the image as it was, and continue with the next stage.
    BestEffort,
}

/// Result of one stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage rewrote the image. `sites` are the addresses it reports.
    Applied { sites: Vec<u32> },
    /// A best-effort stage gave up before writing anything.
    Skipped { reason: String },
    /// The stage does not apply to this model, version or feature set.
    NotApplicable,
}

impl StageOutcome {
    pub fn applied(sites: impl Into<Vec<u32>>) -> Self {
        Self::Applied {
            sites: sites.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// One named patch.
pub trait PatchStage {
    fn name(&self) -> &'static str;

    fn policy(&self) -> FailurePolicy {
        FailurePolicy::Fatal
    }

    /// Whether the stage should run on this image at all.
    fn applies_to(&self, _ctx: &EngineContext) -> bool {
        true
    }

    fn apply(&self, ctx: &mut EngineContext) -> Result<StageOutcome>;
}

/// A stage's name with its outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageReport {
    pub name: &'static str,
    pub outcome: StageOutcome,
}

/// Run one stage under its failure policy.
pub fn run_stage(stage: &dyn PatchStage, ctx: &mut EngineContext) -> Result<StageReport> {
    let name = stage.name();
    if !stage.applies_to(ctx) {
        debug!("{}: not applicable", name);
        return Ok(StageReport {
            name,
            outcome: StageOutcome::NotApplicable,
        });
    }

    let outcome = match stage.apply(ctx) {
        Ok(outcome) => outcome,
        Err(e) if stage.policy() == FailurePolicy::BestEffort && e.is_recoverable() => {
            StageOutcome::skipped(e.to_string())
        }
        Err(e) => return Err(e),
    };

    match &outcome {
        StageOutcome::Applied { sites } => {
            debug!("{}: {} site(s)", name, sites.len());
        }
        StageOutcome::Skipped { reason } => {
            warn!("{}: skipped ({})", name, reason);
        }
        StageOutcome::NotApplicable => {}
    }

    Ok(StageReport { name, outcome })
}

/// A fixed, ordered list of stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Patchset {
    /// Unlock, optimize, fix, shrink and expand.
    Full,
    /// Unlock and optimize only, with a lenient size check.
    Fix,
}

impl Patchset {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Fix => "fix",
        }
    }

    pub fn size_policy(&self) -> SizePolicy {
        match self {
            Self::Full => SizePolicy::Exact,
            Self::Fix => SizePolicy::Range,
        }
    }

    pub fn stages(&self) -> Vec<Box<dyn PatchStage>> {
        let mut stages: Vec<Box<dyn PatchStage>> = Vec::new();
        match self {
            Self::Full => {
                stages.push(Box::new(unlock::RamExecution));
                stages.push(Box::new(unlock::FlashExecution { stealth_ports: true }));
                stages.push(Box::new(unlock::ArchiveMemory));
                stages.push(Box::new(unlock::UnsignedApps {
                    search_from: unlock::APPLICATION_AREA,
                }));
                stages.push(Box::new(unlock::AsmSizeLimit));
                stages.push(Box::new(unlock::InvalidProgramReference));
                stages.extend(optimize_stages());
                stages.push(Box::new(fix::Trap3HeapDeref));
                stages.push(Box::new(fix::ContrastRegisters));
                stages.push(Box::new(fix::BatteryChange));
                stages.push(Box::new(shrink::Shrink));
                stages.push(Box::new(expand::Timers));
            }
            Self::Fix => {
                stages.push(Box::new(unlock::RamExecution));
                stages.push(Box::new(unlock::FlashExecution {
                    stealth_ports: false,
                }));
                stages.push(Box::new(unlock::ArchiveMemory));
                stages.push(Box::new(unlock::UnsignedApps {
                    search_from: unlock::RESET_CODE,
                }));
                stages.extend(optimize_stages());
            }
        }
        stages
    }
}

fn optimize_stages() -> Vec<Box<dyn PatchStage>> {
    vec![
        Box::new(optimize::HeapDeref),
        Box::new(optimize::FontDrawing),
        Box::new(optimize::SfWidth),
        Box::new(optimize::EnglishLanguage),
    ]
}

/// Log one modified site the way every stage reports it.
pub(crate) fn report_site(what: &str, addr: u32) {
    info!("{} at 0x{:06X}", what, addr);
}
