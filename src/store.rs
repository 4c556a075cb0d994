use crate::deck::CanonicalBattle;
use crate::error::StoreError;

/// Persistence the collector needs for individual battles.
pub trait BattleStore {
    /// Insert-or-ignore keyed on (player tag, battle time). Returns the number
    /// of rows that were actually new.
    fn bulk_insert(&self, battles: &[CanonicalBattle]) -> Result<usize, StoreError>;

    /// Deletes battles older than `days` days and returns how many went.
    fn purge_older_than(&self, days: u32) -> Result<usize, StoreError>;
}

/// Aggregated per-deck statistics.
pub trait MetaDeckStore {
    /// Rebuilds every meta deck row from the stored battles (full replace).
    fn recompute(&self) -> Result<(), StoreError>;
}
