use anyhow::{Result, anyhow};
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

/// A finished or in-progress run as stored in history.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub server_id: String,
    pub job_id: Option<String>,
    pub final_state: Option<String>,
    pub drive_file_id: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    /// Most recent logged status
    pub last_status: String,
}

pub async fn create(conn: &Connection, run_id: String, server_id: String) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO runs (id, server_id) VALUES (?1, ?2)",
            params![&run_id, &server_id],
        )?;

        let log_id = Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO run_status_log (id, run_id, status, description)
             VALUES (?1, ?2, 'Idle', 'Run started')",
            params![log_id, &run_id],
        )?;

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn update_status(
    conn: &Connection,
    run_id: String,
    status: String,
    description: Option<String>,
) -> Result<()> {
    conn.call(move |c| {
        let log_id = Uuid::now_v7().to_string();
        c.execute(
            "INSERT INTO run_status_log (id, run_id, status, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![log_id, run_id, status, description],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn finish(
    conn: &Connection,
    run_id: String,
    final_state: String,
    job_id: Option<String>,
    drive_file_id: Option<String>,
) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE runs
             SET final_state = ?2, job_id = ?3, drive_file_id = ?4, finished_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![run_id, final_state, job_id, drive_file_id],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Latest runs first.
pub async fn recent(conn: &Connection, limit: u32) -> Result<Vec<RunRecord>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT r.id, r.server_id, r.job_id, r.final_state, r.drive_file_id, r.started_at, r.finished_at,
             COALESCE((SELECT status FROM run_status_log WHERE run_id = r.id ORDER BY rowid DESC LIMIT 1), 'Unknown') as status
             FROM runs r
             ORDER BY r.rowid DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit], |row| {
            Ok(RunRecord {
                id: row.get(0)?,
                server_id: row.get(1)?,
                job_id: row.get(2)?,
                final_state: row.get(3)?,
                drive_file_id: row.get(4)?,
                started_at: row.get(5)?,
                finished_at: row.get(6)?,
                last_status: row.get(7)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to list runs: {}", e))
}

/// Status transitions of one run, oldest first.
pub async fn history(conn: &Connection, run_id: String) -> Result<Vec<(String, Option<String>)>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT status, description FROM run_status_log WHERE run_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to read run history: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn records_transitions_in_order() {
        let conn = db::init_in_memory().await.unwrap();
        let run_id = Uuid::now_v7().to_string();

        create(&conn, run_id.clone(), "srv".into()).await.unwrap();
        update_status(&conn, run_id.clone(), "Creating".into(), None)
            .await
            .unwrap();
        update_status(
            &conn,
            run_id.clone(),
            "Failed".into(),
            Some("no id".into()),
        )
        .await
        .unwrap();
        finish(&conn, run_id.clone(), "Failed".into(), None, None)
            .await
            .unwrap();

        let log = history(&conn, run_id.clone()).await.unwrap();
        let statuses: Vec<_> = log.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(statuses, vec!["Idle", "Creating", "Failed"]);
        assert_eq!(log[2].1.as_deref(), Some("no id"));

        let runs = recent(&conn, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run_id);
        assert_eq!(runs[0].final_state.as_deref(), Some("Failed"));
        assert_eq!(runs[0].last_status, "Failed");
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let conn = db::init_in_memory().await.unwrap();
        let first = Uuid::now_v7().to_string();
        let second = Uuid::now_v7().to_string();

        create(&conn, first.clone(), "srv".into()).await.unwrap();
        create(&conn, second.clone(), "srv".into()).await.unwrap();

        let runs = recent(&conn, 1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, second);
    }
}
