pub mod fields;
pub mod location;

use std::fmt;

use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::error;

pub use location::{InvalidLocation, Location};

/// Result type used by the content store.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    /// No item or asset under the requested key.
    NotFound(String),
    Backend(sqlx::Error),
}

impl StoreError {
    fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "not found in store: {key}"),
            Self::Backend(err) => write!(f, "store backend error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err)
    }
}

/// A content node: definition payload, free-form metadata, ordered children.
#[derive(Clone, Debug)]
pub struct Item {
    pub location: Location,
    pub data: Option<Value>,
    pub metadata: Map<String, Value>,
    pub children: Vec<String>,
}

impl Item {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            data: None,
            metadata: Map::new(),
            children: Vec::new(),
        }
    }

    pub fn category(&self) -> &str {
        &self.location.category
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Canonical transcript artifact id, empty string treated as unset.
    pub fn sub(&self) -> Option<&str> {
        self.meta_str("sub").filter(|s| !s.is_empty())
    }

    pub fn html5_sources(&self) -> Vec<String> {
        self.metadata
            .get("html5_sources")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Hosted-video ids keyed by playback speed, unset entries excluded.
    pub fn hosted_speed_ids(&self) -> Vec<(f64, String)> {
        [
            (0.75, "youtube_id_0_75"),
            (1.0, "youtube_id_1_0"),
            (1.25, "youtube_id_1_25"),
            (1.5, "youtube_id_1_5"),
        ]
        .iter()
        .filter_map(|(speed, key)| {
            self.meta_str(key)
                .filter(|id| !id.is_empty())
                .map(|id| (*speed, id.to_string()))
        })
        .collect()
    }
}

/// A stored static asset (transcript artifacts live here).
#[derive(Clone, Debug)]
pub struct Asset {
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Returns a copy of `children` with `url` appended.
pub fn with_child_appended(children: &[String], url: &str) -> Vec<String> {
    let mut out = children.to_vec();
    out.push(url.to_string());
    out
}

/// Returns a copy of `children` with every occurrence of `url` removed.
pub fn without_child(children: &[String], url: &str) -> Vec<String> {
    children.iter().filter(|c| c.as_str() != url).cloned().collect()
}

/// Postgres-backed document store for content items and static assets.
///
/// Handlers receive this as part of the shared state; there is no global
/// accessor.
#[derive(Clone)]
pub struct ContentStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    data: Option<Value>,
    metadata: Value,
    children: Value,
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl ContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_item(&self, location: &Location) -> StoreResult<Item> {
        let row = sqlx::query_as::<_, ItemRow>(
            "SELECT data, metadata, children FROM items WHERE location = $1",
        )
        .bind(location.url())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found(location.url()))?;

        Ok(Item {
            location: location.clone(),
            data: row.data,
            metadata: row.metadata.as_object().cloned().unwrap_or_default(),
            children: string_list(&row.children),
        })
    }

    pub async fn create_item(&self, item: &Item) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO items (location, org, course, category, name, data, metadata, children)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(item.location.url())
        .bind(&item.location.org)
        .bind(&item.location.course)
        .bind(&item.location.category)
        .bind(&item.location.name)
        .bind(&item.data)
        .bind(Value::Object(item.metadata.clone()))
        .bind(serde_json::to_value(&item.children).unwrap_or_else(|_| Value::Array(Vec::new())))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_data(&self, location: &Location, data: &Value) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE items SET data = $2, updated_at = NOW() WHERE location = $1",
        )
        .bind(location.url())
        .bind(data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(location.url()));
        }
        Ok(())
    }

    pub async fn update_children(&self, location: &Location, children: &[String]) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE items SET children = $2, updated_at = NOW() WHERE location = $1",
        )
        .bind(location.url())
        .bind(serde_json::to_value(children).unwrap_or_else(|_| Value::Array(Vec::new())))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(location.url()));
        }
        Ok(())
    }

    pub async fn update_metadata(
        &self,
        location: &Location,
        metadata: &Map<String, Value>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE items SET metadata = $2, updated_at = NOW() WHERE location = $1",
        )
        .bind(location.url())
        .bind(Value::Object(metadata.clone()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(location.url()));
        }
        Ok(())
    }

    pub async fn delete_item(&self, location: &Location) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM items WHERE location = $1")
            .bind(location.url())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(location.url()));
        }
        Ok(())
    }

    /// Every item whose children list references `location`.
    pub async fn get_parent_locations(&self, location: &Location) -> StoreResult<Vec<Location>> {
        let urls: Vec<String> = sqlx::query_scalar(
            "SELECT location FROM items WHERE children @> jsonb_build_array($1::text)",
        )
        .bind(location.url())
        .fetch_all(&self.pool)
        .await?;

        Ok(urls
            .into_iter()
            .filter_map(|url| match Location::parse(&url) {
                Ok(parent) => Some(parent),
                Err(err) => {
                    error!(%err, "unparsable location key in items table");
                    None
                }
            })
            .collect())
    }

    pub async fn find_asset(&self, org: &str, course: &str, name: &str) -> StoreResult<Asset> {
        let row: Option<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT content_type, content FROM assets WHERE org = $1 AND course = $2 AND name = $3",
        )
        .bind(org)
        .bind(course)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let (content_type, content) =
            row.ok_or_else(|| StoreError::not_found(format!("{org}/{course}/{name}")))?;
        Ok(Asset {
            content_type,
            content,
        })
    }

    pub async fn save_asset(
        &self,
        org: &str,
        course: &str,
        name: &str,
        content_type: &str,
        content: &[u8],
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO assets (org, course, name, content_type, content)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (org, course, name)
             DO UPDATE SET content_type = EXCLUDED.content_type, content = EXCLUDED.content,
                           updated_at = NOW()",
        )
        .bind(org)
        .bind(course)
        .bind(name)
        .bind(content_type)
        .bind(content)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns whether an asset was actually removed.
    pub async fn delete_asset(&self, org: &str, course: &str, name: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM assets WHERE org = $1 AND course = $2 AND name = $3",
        )
        .bind(org)
        .bind(course)
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item_with_metadata(value: Value) -> Item {
        let location = Location::parse("i4x://acme/Certs101/video/welcome").unwrap();
        let mut item = Item::new(location);
        item.metadata = value.as_object().unwrap().clone();
        item
    }

    #[test]
    fn appended_child_lands_last() {
        let children = vec!["i4x://acme/C/video/a".to_string()];
        let out = with_child_appended(&children, "i4x://acme/C/video/b");
        assert_eq!(out.len(), 2);
        assert_eq!(out.last().unwrap(), "i4x://acme/C/video/b");
    }

    #[test]
    fn without_child_removes_every_occurrence() {
        let url = "i4x://acme/C/video/a";
        let children = vec![
            url.to_string(),
            "i4x://acme/C/video/b".to_string(),
            url.to_string(),
        ];
        let out = without_child(&children, url);
        assert_eq!(out, vec!["i4x://acme/C/video/b".to_string()]);
    }

    #[test]
    fn without_child_shrinks_by_occurrence_count() {
        let url = "i4x://acme/C/video/a";
        let children = vec![url.to_string(), url.to_string()];
        assert_eq!(without_child(&children, url).len(), children.len() - 2);
    }

    #[test]
    fn sub_treats_empty_as_unset() {
        let item = item_with_metadata(json!({"sub": ""}));
        assert_eq!(item.sub(), None);

        let item = item_with_metadata(json!({"sub": "welcome"}));
        assert_eq!(item.sub(), Some("welcome"));
    }

    #[test]
    fn hosted_speed_ids_skip_unset_entries() {
        let item = item_with_metadata(json!({
            "youtube_id_1_0": "OEoXaMPEzfM",
            "youtube_id_1_5": "",
        }));
        let ids = item.hosted_speed_ids();
        assert_eq!(ids, vec![(1.0, "OEoXaMPEzfM".to_string())]);
    }

    #[test]
    fn html5_sources_default_to_empty() {
        let item = item_with_metadata(json!({}));
        assert!(item.html5_sources().is_empty());
    }
}
