//! Stale market-data cleanup (supplemented feature, spec_full §"Supplemented
//! features"). Grounded on `original_source/scripts/cleanup_stale_market_data.py`:
//! the orchestrator runs this opportunistically every N ticks so `dex_symbols`
//! doesn't accumulate rows the finder's staleness filter has to scan forever.

use chrono::NaiveDateTime;

use super::Db;
use crate::errors::CoreResult;

impl Db {
    /// Deletes `dex_symbols` rows untouched for longer than `max_age`.
    /// Returns the number of rows removed.
    pub async fn purge_stale_market_data(
        &self,
        max_age: chrono::Duration,
        now: NaiveDateTime,
    ) -> CoreResult<usize> {
        let cutoff = (now - max_age).format("%Y-%m-%d %H:%M:%S%.6f").to_string();
        self.run(move |conn| conn.execute("DELETE FROM dex_symbols WHERE updated_at < ?1", [cutoff]))
            .await
    }
}
