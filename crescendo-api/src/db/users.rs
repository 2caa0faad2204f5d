//! User lookups

use crate::{Error, Result};
use crescendo_common::db::models::User;
use sqlx::{Row, SqlitePool};

pub async fn get_user(db: &SqlitePool, user_id: i64) -> Result<User> {
    let row = sqlx::query("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;

    Ok(User {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        phone: row.get("phone"),
    })
}
