//! # Lock Modes
//!
//! The twelve lock modes of the multi-granularity locking protocol, together with the two static
//! tables that drive every decision of the lock manager:
//!
//! - The **compatibility matrix** decides whether a requested mode may coexist with a mode that
//!   is already granted on the same resource.
//! - The **conversion matrix** yields the most restrictive mode implied by holding two modes at
//!   once. Folding it over a granted list gives the aggregate granted mode of a resource.
//!
//! Both tables are plain `const` arrays indexed by the mode discriminant, so they are total by
//! construction. Their internal consistency (symmetry, `Free` as identity, `SchemaModification`
//! conflicting with everything) is checked at compile time by [`tables_are_consistent`].
//!
//! # Compatibility Between Lock Modes
//!
//! | Granted \ Requested | Sch-S | Sch-M | S   | U   | X   | IS  | IU  | IX  | SIU | SIX | UIX |
//! |---------------------|-------|-------|-----|-----|-----|-----|-----|-----|-----|-----|-----|
//! | Sch-S               | Yes   | No    | Yes | Yes | Yes | Yes | Yes | Yes | Yes | Yes | Yes |
//! | Sch-M               | No    | No    | No  | No  | No  | No  | No  | No  | No  | No  | No  |
//! | S                   | Yes   | No    | Yes | Yes | No  | Yes | Yes | No  | Yes | No  | No  |
//! | U                   | Yes   | No    | Yes | No  | No  | Yes | No  | No  | No  | No  | No  |
//! | X                   | Yes   | No    | No  | No  | No  | No  | No  | No  | No  | No  | No  |
//! | IS                  | Yes   | No    | Yes | Yes | No  | Yes | Yes | Yes | Yes | Yes | Yes |
//! | IU                  | Yes   | No    | Yes | No  | No  | Yes | Yes | Yes | Yes | Yes | No  |
//! | IX                  | Yes   | No    | No  | No  | No  | Yes | Yes | Yes | No  | No  | No  |
//! | SIU                 | Yes   | No    | Yes | No  | No  | Yes | Yes | No  | Yes | No  | No  |
//! | SIX                 | Yes   | No    | No  | No  | No  | Yes | Yes | No  | No  | No  | No  |
//! | UIX                 | Yes   | No    | No  | No  | No  | Yes | No  | No  | No  | No  | No  |
//!
//! `Free` is compatible with every mode and omitted above.

use strum::{EnumCount, EnumIter};

#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount,
)]
#[repr(u8)]
pub enum LockMode {
    /// No lock at all. Never requested, only used as the aggregate of an idle resource.
    Free = 0,
    /// Protects the schema of an object against modification while it is being used.
    SchemaStability = 1,
    /// Schema change in progress. Conflicts with every other mode.
    SchemaModification = 2,
    Shared = 3,
    /// Read with the intention to write later. Only one owner may hold it at a time.
    Update = 4,
    Exclusive = 5,
    IntentShared = 6,
    IntentUpdate = 7,
    IntentExclusive = 8,
    SharedIntentUpdate = 9,
    SharedIntentExclusive = 10,
    UpdateIntentExclusive = 11,
}

/// Outcome of a compatibility lookup between a granted and a requested [`LockMode`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockCompatibility {
    Conflict,
    NoConflict,
}

const MODE_COUNT: usize = LockMode::COUNT;

use LockCompatibility::{Conflict as C, NoConflict as N};

/// Granted mode is the row, requested mode is the column.
const COMPATIBILITY: [[LockCompatibility; MODE_COUNT]; MODE_COUNT] = [
    //F  Sch-S Sch-M S  U  X  IS IU IX SIU SIX UIX
    [N, N, N, N, N, N, N, N, N, N, N, N], // Free
    [N, N, C, N, N, N, N, N, N, N, N, N], // SchemaStability
    [N, C, C, C, C, C, C, C, C, C, C, C], // SchemaModification
    [N, N, C, N, N, C, N, N, C, N, C, C], // Shared
    [N, N, C, N, C, C, N, C, C, C, C, C], // Update
    [N, N, C, C, C, C, C, C, C, C, C, C], // Exclusive
    [N, N, C, N, N, C, N, N, N, N, N, N], // IntentShared
    [N, N, C, N, C, C, N, N, N, N, N, C], // IntentUpdate
    [N, N, C, C, C, C, N, N, N, C, C, C], // IntentExclusive
    [N, N, C, N, C, C, N, N, C, N, C, C], // SharedIntentUpdate
    [N, N, C, C, C, C, N, N, C, C, C, C], // SharedIntentExclusive
    [N, N, C, C, C, C, N, C, C, C, C, C], // UpdateIntentExclusive
];

const F: LockMode = LockMode::Free;
const SCH_S: LockMode = LockMode::SchemaStability;
const SCH_M: LockMode = LockMode::SchemaModification;
const S: LockMode = LockMode::Shared;
const U: LockMode = LockMode::Update;
const X: LockMode = LockMode::Exclusive;
const IS: LockMode = LockMode::IntentShared;
const IU: LockMode = LockMode::IntentUpdate;
const IX: LockMode = LockMode::IntentExclusive;
const SIU: LockMode = LockMode::SharedIntentUpdate;
const SIX: LockMode = LockMode::SharedIntentExclusive;
const UIX: LockMode = LockMode::UpdateIntentExclusive;

/// Granted mode is the row, additional mode is the column, the value is the combined mode.
const CONVERSION: [[LockMode; MODE_COUNT]; MODE_COUNT] = [
    [F, SCH_S, SCH_M, S, U, X, IS, IU, IX, SIU, SIX, UIX],
    [SCH_S, SCH_S, SCH_M, S, U, X, IS, IU, IX, SIU, SIX, UIX],
    [SCH_M, SCH_M, SCH_M, SCH_M, SCH_M, SCH_M, SCH_M, SCH_M, SCH_M, SCH_M, SCH_M, SCH_M],
    [S, S, SCH_M, S, U, X, S, SIU, SIX, SIU, SIX, UIX],
    [U, U, SCH_M, U, U, X, U, U, UIX, U, UIX, UIX],
    [X, X, SCH_M, X, X, X, X, X, X, X, X, X],
    [IS, IS, SCH_M, S, U, X, IS, IU, IX, SIU, SIX, UIX],
    [IU, IU, SCH_M, SIU, U, X, IU, IU, IX, SIU, SIX, UIX],
    [IX, IX, SCH_M, SIX, UIX, X, IX, IX, IX, SIX, SIX, UIX],
    [SIU, SIU, SCH_M, SIU, U, X, SIU, SIU, SIX, SIU, SIX, UIX],
    [SIX, SIX, SCH_M, SIX, UIX, X, SIX, SIX, SIX, SIX, SIX, UIX],
    [UIX, UIX, SCH_M, UIX, UIX, X, UIX, UIX, UIX, UIX, UIX, UIX],
];

/// Verifies the static tables: both symmetric, `Free` is the identity of the conversion and
/// compatible with everything, `SchemaModification` conflicts with every mode but `Free`, and
/// every conversion is idempotent.
const fn tables_are_consistent() -> bool {
    let mut g = 0;
    while g < MODE_COUNT {
        let mut r = 0;
        while r < MODE_COUNT {
            if COMPATIBILITY[g][r] as u8 != COMPATIBILITY[r][g] as u8 {
                return false;
            }
            if CONVERSION[g][r] as u8 != CONVERSION[r][g] as u8 {
                return false;
            }
            r += 1;
        }
        if COMPATIBILITY[F as usize][g] as u8 != N as u8 {
            return false;
        }
        if CONVERSION[g][F as usize] as u8 != g as u8 || CONVERSION[g][g] as u8 != g as u8 {
            return false;
        }
        if g != F as usize && COMPATIBILITY[SCH_M as usize][g] as u8 != C as u8 {
            return false;
        }
        g += 1;
    }
    true
}

const _: () = assert!(
    tables_are_consistent(),
    "lock compatibility/conversion tables are inconsistent"
);

impl LockMode {
    #[inline]
    const fn index(self) -> usize {
        self as usize
    }

    /// Returns `true` for the modes that only read: `IntentShared`, `Shared` and
    /// `SchemaStability`.
    #[inline]
    pub const fn is_shared(self) -> bool {
        matches!(
            self,
            LockMode::IntentShared | LockMode::Shared | LockMode::SchemaStability
        )
    }

    /// Returns `true`, when `self` may be granted while `granted` is held on the same resource.
    #[inline]
    pub const fn is_compatible_with(self, granted: LockMode) -> bool {
        matches!(compatibility(granted, self), LockCompatibility::NoConflict)
    }

    /// The most restrictive mode implied by holding both `self` and `other`.
    #[inline]
    pub const fn max(self, other: LockMode) -> LockMode {
        convert_to_max(other, self)
    }
}

/// Looks up whether `requested` conflicts with the already `granted` mode.
#[inline]
pub const fn compatibility(granted: LockMode, requested: LockMode) -> LockCompatibility {
    COMPATIBILITY[granted.index()][requested.index()]
}

/// Combines the `granted` mode with an additional `requested` mode.
#[inline]
pub const fn convert_to_max(granted: LockMode, requested: LockMode) -> LockMode {
    CONVERSION[granted.index()][requested.index()]
}
