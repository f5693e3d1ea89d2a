//! Absolute pointer fixups for relocated data.
//!
//! When a block of data moves, every long word that holds its old address
//! has to be rewritten. Fixups are checked against the image before any of
//! them is written, so a table that does not match the OS leaves the image
//! untouched.

use crate::context::EngineContext;
use crate::error::{Error, Result};

/// The kind of pointer fixup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixupKind {
    /// Pointer elsewhere in the OS to a moved block.
    Reference,
    /// Pointer to a block that duplicates another one; it is redirected to
    /// the copy that was kept and the duplicate is dropped.
    Alias,
    /// Pointer inside a moved block to another part of the same block.
    Internal,
}

/// A pointer rewrite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointerFixup {
    pub kind: FixupKind,
    /// Where the pointer lives once all blocks have moved.
    pub location: u32,
    /// Where the pointer lives before anything moved.
    pub original_location: u32,
    /// Value expected at `original_location`.
    pub old_value: u32,
    pub new_value: u32,
}

impl PointerFixup {
    pub fn reference(location: u32, old_value: u32, new_value: u32) -> Self {
        Self {
            kind: FixupKind::Reference,
            location,
            original_location: location,
            old_value,
            new_value,
        }
    }

    pub fn alias(location: u32, old_value: u32, new_value: u32) -> Self {
        Self {
            kind: FixupKind::Alias,
            ..Self::reference(location, old_value, new_value)
        }
    }

    /// A pointer at `offset` inside a block moved from `source` to
    /// `destination`, pointing `target` bytes into the same block.
    pub fn internal(source: u32, destination: u32, offset: u32, target: u32) -> Self {
        Self {
            kind: FixupKind::Internal,
            location: destination + offset,
            original_location: source + offset,
            old_value: source + target,
            new_value: destination + target,
        }
    }
}

/// Statistics about applied fixups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FixupStats {
    pub references: usize,
    pub aliases: usize,
    pub internal: usize,
}

impl FixupStats {
    /// Total number of fixups.
    pub fn total(&self) -> usize {
        self.references + self.aliases + self.internal
    }
}

/// Confirm every pointer still holds the value the table expects.
pub fn verify_fixups(ctx: &mut EngineContext, fixups: &[PointerFixup]) -> Result<()> {
    for fix in fixups {
        let found = ctx.get_u32(fix.original_location)?;
        if found != fix.old_value {
            return Err(Error::UnexpectedLayout(format!(
                "pointer at 0x{:06X} is 0x{:06X}, expected 0x{:06X}",
                fix.original_location, found, fix.old_value
            )));
        }
    }
    Ok(())
}

/// Write the new pointer values.
pub fn apply_fixups(ctx: &mut EngineContext, fixups: &[PointerFixup]) -> Result<FixupStats> {
    let mut stats = FixupStats::default();

    for fix in fixups {
        ctx.put_u32(fix.location, fix.new_value)?;
        match fix.kind {
            FixupKind::Reference => stats.references += 1,
            FixupKind::Alias => stats.aliases += 1,
            FixupKind::Internal => stats.internal += 1,
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;

    #[test]
    fn test_fixup_stats() {
        let stats = FixupStats {
            references: 3,
            aliases: 1,
            internal: 2,
        };
        assert_eq!(stats.total(), 6);
    }

    #[test]
    fn test_internal_fixup_addresses() {
        let fix = PointerFixup::internal(0x33FFB0, 0x214000, 38, 16);
        assert_eq!(fix.location, 0x214026);
        assert_eq!(fix.original_location, 0x33FFD6);
        assert_eq!(fix.old_value, 0x33FFC0);
        assert_eq!(fix.new_value, 0x214010);
    }

    #[test]
    fn test_verify_then_apply() {
        let mut bytes = blank();
        put_u32(&mut bytes, 0x214000, 0x215000);
        put_u32(&mut bytes, 0x214004, 0x215000);
        let mut ctx = open(bytes);

        let fixups = vec![
            PointerFixup::reference(0x214000, 0x215000, 0x216000),
            PointerFixup::alias(0x214004, 0x215000, 0x216000),
        ];
        verify_fixups(&mut ctx, &fixups).unwrap();
        let stats = apply_fixups(&mut ctx, &fixups).unwrap();
        assert_eq!(stats.references, 1);
        assert_eq!(stats.aliases, 1);
        assert_eq!(ctx.get_u32(0x214004).unwrap(), 0x216000);
    }

    #[test]
    fn test_verify_rejects_stale_pointer() {
        let mut ctx = open(blank());
        let fixups = [PointerFixup::reference(0x214000, 0x215000, 0x216000)];
        assert!(matches!(
            verify_fixups(&mut ctx, &fixups),
            Err(Error::UnexpectedLayout(_))
        ));
    }
}
