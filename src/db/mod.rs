use anyhow::Result;
use std::path::Path;
use tokio_rusqlite::Connection;

pub mod runs;
pub mod targets;

/// Open (creating if needed) the registry database at `path`.
pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let conn = Connection::open(path).await?;
    migrate(&conn).await?;
    Ok(conn)
}

pub async fn migrate(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn in_memory() -> Connection {
    let conn = Connection::open_in_memory().await.unwrap();
    migrate(&conn).await.unwrap();
    conn
}
