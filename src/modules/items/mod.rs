use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::error;
use uuid::Uuid;

use crate::{
    modules::transcripts,
    store::{
        self, ContentStore, Item, Location, StoreError,
        fields::{FieldRegistry, apply_metadata_patch},
    },
    web::{ApiError, AppState, auth, json_error},
};

/// Categories excluded from parent-child linkage.
pub const DETACHED_CATEGORIES: &[&str] = &["about", "static_tab", "course_info"];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/save_item", post(save_item))
        .route("/create_item", post(create_item))
        .route("/delete_item", post(delete_item))
}

#[derive(Deserialize)]
struct SaveItemRequest {
    id: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    children: Option<Vec<String>>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    #[serde(default)]
    nullout: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct CreateItemRequest {
    parent_location: String,
    category: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    boilerplate: Option<String>,
}

#[derive(Deserialize)]
struct DeleteItemRequest {
    id: String,
    #[serde(default)]
    delete_children: bool,
    #[serde(default)]
    delete_all_versions: bool,
}

fn store_failure(err: StoreError) -> ApiError {
    error!(%err, "content store operation failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
}

/// Partial update of an item. Missing items are a soft failure: the response
/// is an empty success body, matching the legacy contract.
async fn save_item(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<SaveItemRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = auth::require_user(&state, &jar).await?;
    let store = state.store();

    let location = match Location::parse(&request.id) {
        Ok(location) => location,
        Err(err) => {
            error!(%err, "can't parse item location");
            return Ok(Json(json!({})));
        }
    };

    let old_item = match store.get_item(&location).await {
        Ok(item) => item,
        Err(err) if err.is_not_found() => {
            error!(location = %location, "can't find item by location");
            return Ok(Json(json!({})));
        }
        Err(err) => return Err(store_failure(err)),
    };

    auth::require_course_access(&state, &user, &location.org, &location.course).await?;

    if let Some(data) = &request.data {
        store.update_data(&location, data).await.map_err(store_failure)?;
    }

    // An empty list is a valid replacement; only an absent field leaves the
    // children untouched.
    if let Some(children) = &request.children {
        store
            .update_children(&location, children)
            .await
            .map_err(store_failure)?;
    }

    if request.nullout.is_some() || request.metadata.is_some() {
        // The submitted metadata is partial; patch on top of the stored map so
        // fields the editor never surfaces survive the save.
        let mut item = store.get_item(&location).await.map_err(store_failure)?;
        let registry = FieldRegistry::for_category(item.category());
        let nullout = request.nullout.unwrap_or_default();
        let metadata = request.metadata.unwrap_or_default();

        apply_metadata_patch(&mut item.metadata, &nullout, &metadata, &registry)
            .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;

        store
            .update_metadata(&location, &item.metadata)
            .await
            .map_err(store_failure)?;
    }

    let new_item = store.get_item(&location).await.map_err(store_failure)?;
    if new_item.category() == "video" {
        transcripts::manage_video_transcripts(store, &old_item, &new_item).await;
    }

    Ok(Json(json!({})))
}

async fn create_item(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<CreateItemRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = auth::require_user(&state, &jar).await?;
    let store = state.store();

    let parent_location = Location::parse(&request.parent_location)
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;

    auth::require_course_access(&state, &user, &parent_location.org, &parent_location.course)
        .await?;

    let parent = match store.get_item(&parent_location).await {
        Ok(parent) => parent,
        Err(err) if err.is_not_found() => {
            return Err(json_error(StatusCode::NOT_FOUND, "Parent item not found."));
        }
        Err(err) => return Err(store_failure(err)),
    };

    let name = Uuid::new_v4().simple().to_string();
    let dest_location = parent_location
        .replace(&request.category, &name)
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;

    let (mut metadata, data) = request
        .boilerplate
        .as_deref()
        .and_then(|template_id| boilerplate(&request.category, template_id))
        .unwrap_or_default();

    if let Some(display_name) = &request.display_name {
        metadata.insert(
            "display_name".to_string(),
            Value::String(display_name.clone()),
        );
    }

    let item = Item {
        location: dest_location.clone(),
        data,
        metadata,
        children: Vec::new(),
    };
    store.create_item(&item).await.map_err(store_failure)?;

    if !DETACHED_CATEGORIES.contains(&request.category.as_str()) {
        let children = store::with_child_appended(&parent.children, &dest_location.url());
        store
            .update_children(&parent_location, &children)
            .await
            .map_err(store_failure)?;
    }

    Ok(Json(json!({ "id": dest_location.url() })))
}

async fn delete_item(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<DeleteItemRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = auth::require_user(&state, &jar).await?;
    let store = state.store();

    let location = match Location::parse(&request.id) {
        Ok(location) => location,
        Err(err) => {
            error!(%err, "can't parse item location");
            return Ok(Json(json!({})));
        }
    };

    let item = match store.get_item(&location).await {
        Ok(item) => item,
        Err(err) if err.is_not_found() => {
            error!(location = %location, "can't find item by location");
            return Ok(Json(json!({})));
        }
        Err(err) => return Err(store_failure(err)),
    };

    auth::require_course_access(&state, &user, &location.org, &location.course).await?;

    let doomed = if request.delete_children {
        collect_subtree(store, item).await.map_err(store_failure)?
    } else {
        vec![item.location]
    };

    for target in &doomed {
        match store.delete_item(target).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(store_failure(err)),
        }
    }

    // Remove the dangling references our deletion just created. Parent lookup
    // only happens on the all-versions path, matching the legacy contract.
    if request.delete_all_versions {
        let url = location.url();
        let parents = store
            .get_parent_locations(&location)
            .await
            .map_err(store_failure)?;

        for parent_location in parents {
            let parent = match store.get_item(&parent_location).await {
                Ok(parent) => parent,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(store_failure(err)),
            };
            if parent.children.iter().any(|child| child == &url) {
                let children = store::without_child(&parent.children, &url);
                store
                    .update_children(&parent_location, &children)
                    .await
                    .map_err(store_failure)?;
            }
        }
    }

    Ok(Json(json!({})))
}

/// The subtree rooted at `root`, deepest items first so children are deleted
/// before their parents.
async fn collect_subtree(store: &ContentStore, root: Item) -> Result<Vec<Location>, StoreError> {
    let mut discovered = vec![root.location.clone()];
    let mut pending = vec![root.children];

    while let Some(children) = pending.pop() {
        for child_url in children {
            let child_location = match Location::parse(&child_url) {
                Ok(location) => location,
                Err(err) => {
                    error!(%err, "skipping unparsable child reference");
                    continue;
                }
            };
            match store.get_item(&child_location).await {
                Ok(child) => {
                    discovered.push(child_location);
                    pending.push(child.children);
                }
                Err(err) if err.is_not_found() => {
                    error!(location = %child_location, "child reference points at a missing item");
                }
                Err(err) => return Err(err),
            }
        }
    }

    discovered.reverse();
    Ok(discovered)
}

/// Seed metadata and data for a named per-category template.
fn boilerplate(category: &str, template_id: &str) -> Option<(Map<String, Value>, Option<Value>)> {
    let meta = |entries: &[(&str, Value)]| {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect::<Map<String, Value>>()
    };

    match (category, template_id) {
        ("video", "default") => Some((
            meta(&[
                ("display_name", Value::String("Video".to_string())),
                ("html5_sources", Value::Array(Vec::new())),
            ]),
            Some(json!({ "sources": [] })),
        )),
        ("html", "announcement") => Some((
            meta(&[("display_name", Value::String("Announcement".to_string()))]),
            Some(json!({ "html": "<h2>Announcement</h2>" })),
        )),
        ("html", "empty") => Some((
            meta(&[("display_name", Value::String("Text".to_string()))]),
            Some(json!({ "html": "" })),
        )),
        ("problem", "blank_common") => Some((
            meta(&[
                ("display_name", Value::String("Blank Problem".to_string())),
                ("showanswer", Value::String("finished".to_string())),
            ]),
            Some(json!({ "markdown": "" })),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_categories_stay_out_of_hierarchy() {
        assert!(DETACHED_CATEGORIES.contains(&"about"));
        assert!(DETACHED_CATEGORIES.contains(&"static_tab"));
        assert!(DETACHED_CATEGORIES.contains(&"course_info"));
        assert!(!DETACHED_CATEGORIES.contains(&"video"));
    }

    #[test]
    fn absent_children_differs_from_empty_children() {
        let absent: SaveItemRequest =
            serde_json::from_str(r#"{"id": "i4x://acme/C/video/a"}"#).unwrap();
        assert!(absent.children.is_none());

        let empty: SaveItemRequest =
            serde_json::from_str(r#"{"id": "i4x://acme/C/video/a", "children": []}"#).unwrap();
        assert_eq!(empty.children, Some(Vec::new()));

        let null: SaveItemRequest =
            serde_json::from_str(r#"{"id": "i4x://acme/C/video/a", "children": null}"#).unwrap();
        assert!(null.children.is_none());
    }

    #[test]
    fn delete_flags_default_to_false() {
        let request: DeleteItemRequest =
            serde_json::from_str(r#"{"id": "i4x://acme/C/video/a"}"#).unwrap();
        assert!(!request.delete_children);
        assert!(!request.delete_all_versions);
    }

    #[test]
    fn boilerplate_seeds_known_templates() {
        let (metadata, data) = boilerplate("video", "default").unwrap();
        assert_eq!(metadata["display_name"], Value::String("Video".to_string()));
        assert!(data.is_some());
    }

    #[test]
    fn unknown_boilerplate_is_ignored() {
        assert!(boilerplate("video", "no-such-template").is_none());
        assert!(boilerplate("chapter", "default").is_none());
    }
}
