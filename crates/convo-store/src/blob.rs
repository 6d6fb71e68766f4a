use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha512_256};

use crate::error::Result;

/// Hash bytes the same way `save_blob` does, without touching storage.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha512_256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content-addressed, idempotent: the same bytes always hash (and land) at
/// the same row, so repeated saves of identical content are free.
pub fn save_blob(conn: &Connection, bytes: &[u8]) -> Result<String> {
    let hash = hash_bytes(bytes);
    conn.execute(
        "INSERT OR IGNORE INTO blobs (hash, bytes, created_at) VALUES (?1, ?2, ?3)",
        params![hash, bytes, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(hash)
}

pub fn load_blob(conn: &Connection, hash: &str) -> Result<Option<Vec<u8>>> {
    let bytes = conn
        .query_row(
            "SELECT bytes FROM blobs WHERE hash = ?1",
            params![hash],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_blob_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();

        let h1 = save_blob(&conn, b"hello world").unwrap();
        let h2 = save_blob(&conn, b"hello world").unwrap();
        assert_eq!(h1, h2);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM blobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let loaded = load_blob(&conn, &h1).unwrap().unwrap();
        assert_eq!(loaded, b"hello world");
    }
}
