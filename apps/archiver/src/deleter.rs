//! Purges source rows whose archive has been catalogued. Deletion runs in
//! bounded transactional batches so a multi-million-row window never holds a
//! long transaction: each batch removes the dependent rows first, then the
//! records themselves, and commits before the next batch starts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::models::{Archive, Org};

/// Rows deleted per transaction.
const DELETE_TRANSACTION_SIZE: usize = 100;

const SELECT_MESSAGE_IDS_IN_RANGE: &str = r#"
SELECT id FROM msgs_msg
WHERE org_id = $1 AND created_on >= $2 AND created_on < $3
ORDER BY created_on ASC
"#;

/// Deletes the messages covered by an archive, together with their label
/// joins, attachment rows and channel logs. Replies referencing a deleted
/// message keep their row but lose the reference.
pub async fn delete_archived_messages(pool: &PgPool, archive: &Archive) -> Result<()> {
    let ids: Vec<i64> = sqlx::query_scalar(SELECT_MESSAGE_IDS_IN_RANGE)
        .bind(archive.org_id)
        .bind(archive.start_date)
        .bind(archive.end_date())
        .fetch_all(pool)
        .await
        .context("error selecting message ids for deletion")?;

    for batch in ids.chunks(DELETE_TRANSACTION_SIZE) {
        let batch = batch.to_vec();
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM msgs_msg_labels WHERE msg_id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error deleting message label joins")?;

        sqlx::query("DELETE FROM msgs_attachment WHERE msg_id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error deleting message attachments")?;

        sqlx::query("UPDATE msgs_msg SET response_to_id = NULL WHERE response_to_id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error clearing replies to deleted messages")?;

        sqlx::query("DELETE FROM channels_channellog WHERE msg_id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error deleting channel logs")?;

        sqlx::query("DELETE FROM msgs_msg WHERE id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error deleting messages")?;

        tx.commit().await.context("error committing message deletion batch")?;
    }

    debug!(
        org_id = archive.org_id,
        start_date = %archive.start_date,
        period = %archive.period,
        count = ids.len(),
        "deleted archived messages"
    );
    Ok(())
}

const SELECT_ORPHANED_BROADCASTS: &str = r#"
SELECT b.id FROM msgs_broadcast b
WHERE b.org_id = $1
  AND b.schedule_id IS NULL
  AND b.modified_on < $2
  AND NOT EXISTS (SELECT 1 FROM msgs_msg m WHERE m.broadcast_id = b.id)
"#;

/// Removes broadcasts orphaned by a message purge: no remaining messages, no
/// schedule, and no activity since the archive window closed. Scheduled and
/// recently-active broadcasts survive.
pub async fn delete_orphaned_broadcasts(pool: &PgPool, org: &Org, before: DateTime<Utc>) -> Result<()> {
    let ids: Vec<i64> = sqlx::query_scalar(SELECT_ORPHANED_BROADCASTS)
        .bind(org.id)
        .bind(before)
        .fetch_all(pool)
        .await
        .context("error selecting orphaned broadcasts")?;

    for batch in ids.chunks(DELETE_TRANSACTION_SIZE) {
        let batch = batch.to_vec();
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM msgs_broadcast_contacts WHERE broadcast_id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error deleting broadcast contact joins")?;

        sqlx::query("DELETE FROM msgs_broadcast_groups WHERE broadcast_id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error deleting broadcast group joins")?;

        sqlx::query("DELETE FROM msgs_broadcast_urns WHERE broadcast_id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error deleting broadcast urn joins")?;

        sqlx::query("DELETE FROM msgs_broadcast WHERE id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error deleting broadcasts")?;

        tx.commit().await.context("error committing broadcast deletion batch")?;
    }

    if !ids.is_empty() {
        debug!(org_id = org.id, count = ids.len(), "deleted orphaned broadcasts");
    }
    Ok(())
}

const SELECT_RUN_IDS_IN_RANGE: &str = r#"
SELECT id FROM flows_flowrun
WHERE org_id = $1 AND modified_on >= $2 AND modified_on < $3
ORDER BY modified_on ASC
"#;

/// Deletes the flow runs covered by an archive. Runs outside the window that
/// point at a deleted parent keep their row but lose the reference; recent-run
/// path entries go with their run.
pub async fn delete_archived_runs(pool: &PgPool, archive: &Archive) -> Result<()> {
    let ids: Vec<i64> = sqlx::query_scalar(SELECT_RUN_IDS_IN_RANGE)
        .bind(archive.org_id)
        .bind(archive.start_date)
        .bind(archive.end_date())
        .fetch_all(pool)
        .await
        .context("error selecting run ids for deletion")?;

    for batch in ids.chunks(DELETE_TRANSACTION_SIZE) {
        let batch = batch.to_vec();
        let mut tx = pool.begin().await?;

        sqlx::query("UPDATE flows_flowrun SET parent_id = NULL WHERE parent_id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error clearing children of deleted runs")?;

        sqlx::query("DELETE FROM flows_flowpathrecentrun WHERE run_id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error deleting run path entries")?;

        sqlx::query("DELETE FROM flows_flowrun WHERE id = ANY($1)")
            .bind(&batch)
            .execute(&mut *tx)
            .await
            .context("error deleting runs")?;

        tx.commit().await.context("error committing run deletion batch")?;
    }

    debug!(
        org_id = archive.org_id,
        start_date = %archive.start_date,
        period = %archive.period,
        count = ids.len(),
        "deleted archived runs"
    );
    Ok(())
}
