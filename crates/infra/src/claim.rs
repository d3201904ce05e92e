//! Claim primitive: atomically reserve a bounded batch of ready rows.
//!
//! Two implementations share one contract:
//!
//! - **Postgres**: a single `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)`
//!   statement. Rows locked by a concurrent claimer are skipped rather than
//!   waited on, and selection plus status change commit together. If the
//!   statement aborts, nothing is claimed.
//! - **In-memory**: a compare-and-swap loop over versioned rows. A candidate is
//!   only taken if its version is unchanged since it was observed as ready;
//!   losing a race moves on to the next candidate.
//!
//! Both return at most `limit` rows, oldest-ready first, and two concurrent
//! callers never receive the same row.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::StoreError;

/// Declarative description of a Postgres claim statement.
///
/// `ready`, `order_by`, `set` and `returning` are SQL fragments over the
/// target table aliased as `t`. The limit is always bound as a parameter.
/// Rows come back in `order_by` order as evaluated before the update, so a
/// `set` that rewrites an ordering column does not reshuffle the batch.
#[derive(Debug, Clone, Copy)]
pub struct ClaimQuery<'a> {
    pub table: &'a str,
    pub key: &'a str,
    pub ready: &'a str,
    pub order_by: &'a str,
    pub set: &'a str,
    pub returning: &'a str,
    /// Placeholder index used for the batch limit (e.g. `1` for `$1`).
    pub limit_param: usize,
}

impl ClaimQuery<'_> {
    pub fn sql(&self) -> String {
        format!(
            r#"
            WITH picked AS (
                SELECT t.{key}
                FROM {table} t
                WHERE {ready}
                ORDER BY {order_by}
                LIMIT ${limit}
                FOR UPDATE SKIP LOCKED
            ),
            ranked AS (
                SELECT t.{key}, ROW_NUMBER() OVER (ORDER BY {order_by}) AS claim_rank
                FROM {table} t
                JOIN picked p ON p.{key} = t.{key}
            ),
            claimed AS (
                UPDATE {table} t
                SET {set}
                FROM ranked
                WHERE t.{key} = ranked.{key}
                RETURNING {returning}, ranked.claim_rank
            )
            SELECT * FROM claimed ORDER BY claim_rank
            "#,
            key = self.key,
            table = self.table,
            ready = self.ready,
            order_by = self.order_by,
            limit = self.limit_param,
            set = self.set,
            returning = self.returning,
        )
    }
}

/// A row with a monotonically increasing version, bumped on every write.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub row: T,
}

impl<T> Versioned<T> {
    pub fn new(row: T) -> Self {
        Self { version: 0, row }
    }

    /// Mutate the row and bump its version.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        self.version += 1;
        f(&mut self.row)
    }
}

/// Maximum number of observe/swap rounds before returning a short batch.
const MAX_ROUNDS: usize = 8;

/// Claim up to `limit` rows from an in-memory table.
///
/// `ready` filters candidates, `order_key` sorts them oldest-ready first and
/// `apply` performs the status transition on a won row.
pub fn claim_versioned<K, T, O>(
    table: &RwLock<BTreeMap<K, Versioned<T>>>,
    limit: usize,
    ready: impl Fn(&T) -> bool,
    order_key: impl Fn(&T) -> O,
    apply: impl Fn(&mut T),
) -> Result<Vec<T>, StoreError>
where
    K: Ord + Clone,
    T: Clone,
    O: Ord,
{
    let mut claimed = Vec::new();

    for _ in 0..MAX_ROUNDS {
        let wanted = limit.saturating_sub(claimed.len());
        if wanted == 0 {
            break;
        }

        // Observe: ready candidates and the version each was seen at.
        let mut candidates: Vec<(O, K, u64)> = {
            let rows = table.read().map_err(|_| StoreError::poisoned())?;
            rows.iter()
                .filter(|(_, v)| ready(&v.row))
                .map(|(k, v)| (order_key(&v.row), k.clone(), v.version))
                .collect()
        };
        if candidates.is_empty() {
            break;
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut lost_race = false;
        for (_, key, seen_version) in candidates.into_iter().take(wanted) {
            let mut rows = table.write().map_err(|_| StoreError::poisoned())?;
            let Some(entry) = rows.get_mut(&key) else {
                lost_race = true;
                continue;
            };
            // Swap only if nobody touched the row since we observed it.
            if entry.version != seen_version || !ready(&entry.row) {
                lost_race = true;
                continue;
            }
            entry.update(&apply);
            claimed.push(entry.row.clone());
        }

        if !lost_race {
            break;
        }
    }

    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct Row {
        id: u32,
        claimed: bool,
    }

    fn table(n: u32) -> RwLock<BTreeMap<u32, Versioned<Row>>> {
        RwLock::new(
            (0..n)
                .map(|id| (id, Versioned::new(Row { id, claimed: false })))
                .collect(),
        )
    }

    #[test]
    fn claims_oldest_first_up_to_limit() {
        let t = table(5);
        let got = claim_versioned(&t, 2, |r| !r.claimed, |r| r.id, |r| r.claimed = true).unwrap();
        assert_eq!(got.iter().map(|r| r.id).collect::<Vec<_>>(), vec![0, 1]);

        let got = claim_versioned(&t, 10, |r| !r.claimed, |r| r.id, |r| r.claimed = true).unwrap();
        assert_eq!(got.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn concurrent_claimers_never_overlap() {
        let t = Arc::new(table(200));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = t.clone();
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    loop {
                        let got =
                            claim_versioned(&t, 3, |r| !r.claimed, |r| r.id, |r| r.claimed = true)
                                .unwrap();
                        if got.is_empty() {
                            break mine;
                        }
                        mine.extend(got.into_iter().map(|r| r.id));
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for id in h.join().unwrap() {
                total += 1;
                assert!(seen.insert(id), "row {id} claimed twice");
            }
        }
        assert_eq!(total, 200);
    }

    #[test]
    fn postgres_claim_statement_skips_locked_rows() {
        let sql = ClaimQuery {
            table: "print_jobs",
            key: "job_id",
            ready: "t.status = 'queued'",
            order_by: "t.created_at ASC",
            set: "status = 'claimed'",
            returning: "t.job_id",
            limit_param: 1,
        }
        .sql();
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("LIMIT $1"));
        assert!(sql.contains("WHERE t.job_id = ranked.job_id"));
        assert!(sql.trim_end().ends_with("ORDER BY claim_rank"));
    }
}
