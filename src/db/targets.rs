use anyhow::{Result, anyhow, bail};
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row, types::Type};
use tokio_rusqlite::{Connection, params};

use crate::core::models::TargetRecord;
use crate::session::Credential;

const COLUMNS: &str =
    "name, host, port, username, credential_kind, credential_value, remote_path, log_path";

static TARGET_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("target name pattern is valid")
});

/// Names are used in history rows and on the command line.
pub fn validate_name(name: &str) -> Result<()> {
    if !TARGET_NAME.is_match(name) {
        bail!(
            "Invalid target name '{}': use letters, digits, '.', '_' or '-', starting with a letter or digit",
            name
        );
    }
    Ok(())
}

/// Insert a target, replacing any existing target with the same name.
pub async fn add(conn: &Connection, target: TargetRecord) -> Result<()> {
    let (kind, value) = match &target.credential {
        Credential::Password(password) => ("password", password.clone()),
        Credential::KeyFile(path) => ("key_file", path.to_string_lossy().into_owned()),
    };

    conn.call(move |c| {
        c.execute(
            "INSERT INTO targets (name, host, port, username, credential_kind, credential_value, remote_path, log_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                username = excluded.username,
                credential_kind = excluded.credential_kind,
                credential_value = excluded.credential_value,
                remote_path = excluded.remote_path,
                log_path = excluded.log_path,
                updated_at = CURRENT_TIMESTAMP",
            params![
                &target.name,
                &target.host,
                target.port,
                &target.username,
                kind,
                value,
                &target.remote_path,
                &target.log_path
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn get(conn: &Connection, name: String) -> Result<Option<TargetRecord>> {
    conn.call(move |c| {
        c.query_row(
            &format!("SELECT {} FROM targets WHERE name = ?1", COLUMNS),
            params![name],
            from_row,
        )
        .optional()
    })
    .await
    .map_err(|e| anyhow!("Failed to get target: {}", e))
}

/// Like [`get`], but a missing target is an error.
pub async fn require(conn: &Connection, name: &str) -> Result<TargetRecord> {
    get(conn, name.to_string())
        .await?
        .ok_or_else(|| anyhow!("No target named '{}'. See `ferry targets list`.", name))
}

pub async fn list(conn: &Connection) -> Result<Vec<TargetRecord>> {
    conn.call(|c| {
        let mut stmt = c.prepare(&format!("SELECT {} FROM targets ORDER BY name", COLUMNS))?;
        let rows = stmt.query_map([], from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to list targets: {}", e))
}

/// Returns whether a target was removed.
pub async fn remove(conn: &Connection, name: String) -> Result<bool> {
    let removed = conn
        .call(move |c| {
            let n = c.execute("DELETE FROM targets WHERE name = ?1", params![name])?;
            Ok::<usize, rusqlite::Error>(n)
        })
        .await?;

    Ok(removed > 0)
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<TargetRecord> {
    let kind: String = row.get(4)?;
    let value: String = row.get(5)?;
    let credential = match kind.as_str() {
        "password" => Credential::Password(value),
        "key_file" => Credential::KeyFile(PathBuf::from(value)),
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                4,
                Type::Text,
                Box::new(std::io::Error::other(format!(
                    "unknown credential kind '{}'",
                    other
                ))),
            ));
        }
    };

    Ok(TargetRecord {
        name: row.get(0)?,
        host: row.get(1)?,
        port: row.get(2)?,
        username: row.get(3)?,
        credential,
        remote_path: row.get(6)?,
        log_path: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn web1() -> TargetRecord {
        TargetRecord {
            name: "web1".to_string(),
            host: "10.0.0.5".to_string(),
            port: 22,
            username: "deploy".to_string(),
            credential: Credential::KeyFile(PathBuf::from("/home/deploy/.ssh/id_ed25519")),
            remote_path: "/srv/app".to_string(),
            log_path: Some("/var/log/app.log".to_string()),
        }
    }

    #[test]
    fn target_names_are_restricted() {
        assert!(validate_name("web1").is_ok());
        assert!(validate_name("prod.eu-west_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-web").is_err());
        assert!(validate_name("web 1").is_err());
        assert!(validate_name("web;rm").is_err());
    }

    #[tokio::test]
    async fn add_then_get() {
        let conn = db::in_memory().await;
        add(&conn, web1()).await.unwrap();

        let found = get(&conn, "web1".to_string()).await.unwrap();
        assert_eq!(found, Some(web1()));
        assert!(get(&conn, "web2".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn add_replaces_existing_name() {
        let conn = db::in_memory().await;
        add(&conn, web1()).await.unwrap();

        let mut changed = web1();
        changed.port = 2222;
        changed.credential = Credential::Password("hunter2".to_string());
        changed.log_path = None;
        add(&conn, changed.clone()).await.unwrap();

        let all = list(&conn).await.unwrap();
        assert_eq!(all, vec![changed]);
    }

    #[tokio::test]
    async fn list_is_sorted_by_name() {
        let conn = db::in_memory().await;
        for name in ["zeta", "alpha", "mid"] {
            let mut t = web1();
            t.name = name.to_string();
            add(&conn, t).await.unwrap();
        }

        let names: Vec<String> = list(&conn).await.unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn remove_reports_whether_anything_was_removed() {
        let conn = db::in_memory().await;
        add(&conn, web1()).await.unwrap();

        assert!(remove(&conn, "web1".to_string()).await.unwrap());
        assert!(!remove(&conn, "web1".to_string()).await.unwrap());
        assert!(require(&conn, "web1").await.is_err());
    }
}
