//! Deterministic subject bucketing and flag evaluation.
//!
//! The bucket for a `(flag, subject)` pair is a stable hash, never a
//! runtime RNG: the same pair must land in the same bucket across calls,
//! processes, and releases so a subject never flickers between on and off
//! while a percentage holds steady. Raising the percentage only ever adds
//! subjects; it can never drop one that was already included.

use crate::types::{EvaluationResult, FlagDefinition, FlagId, Stage};

/// Buckets are basis points: [0, 10000) compared against percentage * 100.
pub const BUCKET_SCALE: u16 = 10_000;

/// Compute the deterministic bucket for a `(flag, subject)` pair.
///
/// blake3 over `"<flag>:<subject>"`, first 8 bytes little-endian, reduced
/// to basis points. The separator keeps `("ab", "c")` and `("a", "bc")`
/// from colliding.
pub fn bucket(flag: &FlagId, subject: &str) -> u16 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(flag.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(subject.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % u64::from(BUCKET_SCALE)) as u16
}

/// Evaluate a flag definition for a subject.
///
/// Precedence, first match wins:
///
/// 1. archived -> false
/// 2. deny-list -> false
/// 3. RolledBack -> false (the allow-list does not survive a rollback)
/// 4. allow-list -> true
/// 5. Disabled -> false
/// 6. Full -> true
/// 7. Canary/Ramping -> bucket < percentage
///
/// Pure and lock-free; the only state consulted is the definition itself.
pub fn evaluate(def: &FlagDefinition, subject: &str) -> EvaluationResult {
    let mut result = EvaluationResult {
        flag: def.id.clone(),
        subject: subject.to_string(),
        enabled: false,
        stage: def.stage,
        bucket: None,
    };

    if def.archived || def.deny_list.contains(subject) {
        return result;
    }
    if def.stage == Stage::RolledBack {
        return result;
    }
    if def.allow_list.contains(subject) {
        result.enabled = true;
        return result;
    }

    match def.stage {
        Stage::Disabled => result,
        Stage::Full => {
            result.enabled = true;
            result
        }
        Stage::Canary | Stage::Ramping => {
            let b = bucket(&def.id, subject);
            result.bucket = Some(b);
            result.enabled = u32::from(b) < u32::from(def.percentage) * 100;
            result
        }
        // Handled above; unreachable through the early returns.
        Stage::RolledBack => result,
    }
}
