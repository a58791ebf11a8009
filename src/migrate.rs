use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // Registration order is the autoincrement sequence.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            workspace_path TEXT NOT NULL,
            status TEXT NOT NULL,
            provider TEXT NOT NULL,
            output_dir TEXT NOT NULL DEFAULT 'output',
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status)")
        .execute(pool)
        .await?;

    Ok(())
}
