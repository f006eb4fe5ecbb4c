//! Ordered merge queue per target branch. Positions form a dense
//! permutation `{0, 1, …, n-1}`; every mutation renumbers atomically.

use chrono::Utc;
use db::{
    DBService,
    models::merge_queue::{MergeQueueEntry, MergeQueueStatus},
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MergeQueueError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("no merge queue entry {0}")]
    NotFound(Uuid),
}

#[derive(Clone)]
pub struct MergeQueueService {
    db: DBService,
}

impl MergeQueueService {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }

    pub async fn enqueue(
        &self,
        execution_id: Uuid,
        stream_id: Uuid,
        target_branch: &str,
        priority: i64,
    ) -> Result<MergeQueueEntry, MergeQueueError> {
        let position = MergeQueueEntry::count_for_target(&self.db.pool, target_branch).await?;
        let entry = MergeQueueEntry {
            id: Uuid::new_v4(),
            execution_id,
            stream_id,
            target_branch: target_branch.to_string(),
            position,
            priority,
            status: MergeQueueStatus::Pending,
            added_at: Utc::now(),
            merge_commit: None,
            error: None,
        };
        MergeQueueEntry::insert(&self.db.pool, &entry).await?;
        Ok(entry)
    }

    pub async fn list(&self, target_branch: &str) -> Result<Vec<MergeQueueEntry>, MergeQueueError> {
        Ok(MergeQueueEntry::list_for_target(&self.db.pool, target_branch).await?)
    }

    /// The entry the merge worker should take next: lowest position not
    /// yet settled or in flight.
    pub async fn next_ready(
        &self,
        target_branch: &str,
    ) -> Result<Option<MergeQueueEntry>, MergeQueueError> {
        let entries = self.list(target_branch).await?;
        Ok(entries.into_iter().find(|e| {
            matches!(e.status, MergeQueueStatus::Pending | MergeQueueStatus::Ready)
        }))
    }

    pub async fn mark_status(
        &self,
        id: Uuid,
        status: MergeQueueStatus,
        merge_commit: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), MergeQueueError> {
        let affected =
            MergeQueueEntry::update_status(&self.db.pool, id, status, merge_commit, error).await?;
        if affected == 0 {
            return Err(MergeQueueError::NotFound(id));
        }
        Ok(())
    }

    /// Remove an entry and close the positional gap it leaves.
    pub async fn remove(&self, id: Uuid) -> Result<(), MergeQueueError> {
        let entry = MergeQueueEntry::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(MergeQueueError::NotFound(id))?;

        let remaining: Vec<MergeQueueEntry> =
            MergeQueueEntry::list_for_target(&self.db.pool, &entry.target_branch)
                .await?
                .into_iter()
                .filter(|e| e.id != id)
                .collect();

        let mut tx = self.db.pool.begin().await?;
        MergeQueueEntry::delete(&mut *tx, id).await?;
        for (position, entry) in remaining.into_iter().enumerate() {
            if entry.position != position as i64 {
                MergeQueueEntry::set_position(&mut *tx, entry.id, position as i64).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Move an entry to `new_position`, renumbering everything after it in
    /// one transaction.
    pub async fn reorder(&self, id: Uuid, new_position: i64) -> Result<(), MergeQueueError> {
        let entry = MergeQueueEntry::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(MergeQueueError::NotFound(id))?;

        let mut ordered: Vec<MergeQueueEntry> =
            MergeQueueEntry::list_for_target(&self.db.pool, &entry.target_branch).await?;
        let current_index = ordered
            .iter()
            .position(|e| e.id == id)
            .ok_or(MergeQueueError::NotFound(id))?;
        let moved = ordered.remove(current_index);
        let target_index = (new_position.max(0) as usize).min(ordered.len());
        ordered.insert(target_index, moved);

        let mut tx = self.db.pool.begin().await?;
        for (position, entry) in ordered.iter().enumerate() {
            if entry.position != position as i64 {
                MergeQueueEntry::set_position(&mut *tx, entry.id, position as i64).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Cascade reconciliation: restore the dense permutation for a target
    /// branch after out-of-band mutations.
    pub async fn reconcile_positions(&self, target_branch: &str) -> Result<(), MergeQueueError> {
        let ordered = MergeQueueEntry::list_for_target(&self.db.pool, target_branch).await?;
        let mut tx = self.db.pool.begin().await?;
        for (position, entry) in ordered.iter().enumerate() {
            if entry.position != position as i64 {
                MergeQueueEntry::set_position(&mut *tx, entry.id, position as i64).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
