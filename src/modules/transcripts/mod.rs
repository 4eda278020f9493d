use std::collections::HashSet;

use axum::{
    Json, Router,
    extract::{FromRequest, Multipart, Path as AxumPath, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::{
    store::{ContentStore, Item, Location},
    subs::{self, SubCues, SubsError},
    web::{AppState, AuthUser, ajax_error, ajax_success, auth, json_error},
};

const SUBS_CONTENT_TYPE: &str = "application/json";
const SRT_CONTENT_TYPE: &str = "application/x-subrip";

pub fn router() -> Router<AppState> {
    Router::new().route("/transcripts/:action", get(dispatch).post(dispatch))
}

/// The closed set of transcript workflow actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TranscriptAction {
    Upload,
    Download,
    Check,
    Choose,
    Replace,
}

impl TranscriptAction {
    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "upload" => Some(Self::Upload),
            "download" => Some(Self::Download),
            "check" => Some(Self::Check),
            "choose" => Some(Self::Choose),
            "replace" => Some(Self::Replace),
            _ => None,
        }
    }
}

#[derive(Deserialize, Default)]
struct TranscriptQuery {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

/// Request payload shared by check/choose/replace, carried in the `data`
/// parameter as JSON.
#[derive(Deserialize)]
struct TranscriptsPayload {
    id: String,
    #[serde(default)]
    videos: Vec<VideoSource>,
    #[serde(default)]
    html5_id: Option<String>,
}

#[derive(Deserialize)]
struct VideoSource {
    #[serde(rename = "type")]
    kind: String,
    video: String,
}

#[derive(Serialize)]
struct TranscriptsPresence {
    html5_local: Vec<bool>,
    youtube_local: bool,
    youtube_server: bool,
    status: &'static str,
}

async fn dispatch(
    State(state): State<AppState>,
    AxumPath(action): AxumPath<String>,
    jar: CookieJar,
    Query(query): Query<TranscriptQuery>,
    request: Request,
) -> Response {
    // Unknown actions get an empty success body, not an error.
    let Some(action) = TranscriptAction::from_segment(&action) else {
        return Json(json!({})).into_response();
    };

    let user = match auth::require_user(&state, &jar).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };

    match action {
        TranscriptAction::Upload => {
            let multipart = match Multipart::from_request(request, &state).await {
                Ok(multipart) => multipart,
                Err(err) => {
                    error!(?err, "transcript upload request is not multipart");
                    return ajax_error().into_response();
                }
            };
            upload_transcripts(&state, &user, multipart).await
        }
        TranscriptAction::Download => {
            download_transcripts(&state, &user, query.id.as_deref()).await
        }
        TranscriptAction::Check => check_transcripts(&state, &user, query.data.as_deref()).await,
        TranscriptAction::Choose => choose_transcripts(&state, &user, query.data.as_deref()).await,
        TranscriptAction::Replace => {
            replace_transcripts(&state, &user, query.data.as_deref()).await
        }
    }
}

/// Common prelude for the data-carrying actions: parse the payload, load the
/// item, enforce permission, require a video item. Soft failures come back as
/// a ready-to-send Error envelope; permission denial stays a hard 403.
async fn validate_transcripts_data(
    state: &AppState,
    user: &AuthUser,
    raw: Option<&str>,
) -> Result<(TranscriptsPayload, Item), Response> {
    let Some(raw) = raw.filter(|value| !value.is_empty()) else {
        error!("incoming transcript data is empty");
        return Err(ajax_error().into_response());
    };

    let payload: TranscriptsPayload = match serde_json::from_str(raw) {
        Ok(payload) => payload,
        Err(err) => {
            error!(%err, "malformed transcript data payload");
            return Err(ajax_error().into_response());
        }
    };

    let location = match Location::parse(&payload.id) {
        Ok(location) => location,
        Err(err) => {
            error!(%err, "can't parse item location");
            return Err(ajax_error().into_response());
        }
    };

    let item = match state.store().get_item(&location).await {
        Ok(item) => item,
        Err(err) if err.is_not_found() => {
            error!(location = %location, "can't find item by location");
            return Err(ajax_error().into_response());
        }
        Err(err) => {
            error!(%err, "failed to load item");
            return Err(
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
                    .into_response(),
            );
        }
    };

    if let Err(err) =
        auth::require_course_access(state, user, &location.org, &location.course).await
    {
        return Err(err.into_response());
    }

    if item.category() != "video" {
        error!("transcripts are supported only for video items");
        return Err(ajax_error().into_response());
    }

    Ok((payload, item))
}

/// Local html5 candidates in request order, duplicates removed.
fn html5_candidates(videos: &[VideoSource]) -> Vec<String> {
    let mut seen = HashSet::new();
    videos
        .iter()
        .filter(|video| video.kind != "youtube")
        .filter(|video| seen.insert(video.video.clone()))
        .map(|video| video.video.clone())
        .collect()
}

/// The first hosted-video candidate's id, if any.
fn first_hosted_id(videos: &[VideoSource]) -> Option<&str> {
    videos
        .iter()
        .find(|video| video.kind == "youtube")
        .map(|video| video.video.as_str())
}

/// Derive the transcript slug from an uploaded filename: the extension must
/// be `.srt` and the stem must survive slugification.
fn upload_slug(filename: &str) -> Result<String, SubsError> {
    let (stem, extension) = filename
        .rsplit_once('.')
        .ok_or_else(|| SubsError::new("undefined file extension"))?;

    if !extension.eq_ignore_ascii_case("srt") {
        return Err(SubsError::new(format!(
            "unsupported transcript format `.{extension}`"
        )));
    }

    let slug = subs::slugify(stem);
    if slug.is_empty() {
        return Err(SubsError::new("filename yields an empty transcript id"));
    }
    Ok(slug)
}

#[derive(Default)]
struct UploadForm {
    id: Option<String>,
    filename: Option<String>,
    file: Option<Vec<u8>>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, SubsError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| SubsError::new(format!("failed to parse upload form: {err}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        if let Some(filename) = field.file_name() {
            if name == "file" {
                form.filename = Some(sanitize_filename::sanitize(filename));
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| SubsError::new(format!("failed to read upload data: {err}")))?;
                form.file = Some(bytes.to_vec());
            }
        } else if name == "id" {
            form.id = Some(
                field
                    .text()
                    .await
                    .map_err(|err| SubsError::new(format!("failed to read form field: {err}")))?,
            );
        }
    }

    Ok(form)
}

async fn upload_transcripts(state: &AppState, user: &AuthUser, multipart: Multipart) -> Response {
    let form = match read_upload_form(multipart).await {
        Ok(form) => form,
        Err(err) => {
            error!(%err, "failed to read transcript upload form");
            return ajax_error().into_response();
        }
    };

    let Some(item_location) = form.id else {
        error!("POST data without `id` form data");
        return ajax_error().into_response();
    };
    let (Some(filename), Some(filedata)) = (form.filename, form.file) else {
        error!("POST data without `file` form data");
        return ajax_error().into_response();
    };

    let slug = match upload_slug(&filename) {
        Ok(slug) => slug,
        Err(err) => {
            error!(%err, "rejected transcript upload");
            return ajax_error().into_response();
        }
    };

    let location = match Location::parse(&item_location) {
        Ok(location) => location,
        Err(err) => {
            error!(%err, "can't parse item location");
            return ajax_error().into_response();
        }
    };

    let store = state.store();
    let item = match store.get_item(&location).await {
        Ok(item) => item,
        Err(err) if err.is_not_found() => {
            error!(location = %location, "can't find item by location");
            return ajax_error().into_response();
        }
        Err(err) => {
            error!(%err, "failed to load item");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
                .into_response();
        }
    };

    if let Err(err) =
        auth::require_course_access(state, user, &location.org, &location.course).await
    {
        return err.into_response();
    }

    if item.category() != "video" {
        error!("transcripts are supported only for video items");
        return ajax_error().into_response();
    }

    let has_hosted_ids = !item.hosted_speed_ids().is_empty();
    let html5_sources = item.html5_sources();

    if has_hosted_ids && html5_sources.is_empty() {
        // Hosted-only items would need their transcripts converted, which a
        // local upload cannot do.
        error!("refusing local transcript upload for a hosted-only video");
        return ajax_error().into_response();
    }
    if html5_sources.is_empty() {
        error!("empty video sources");
        return ajax_error().into_response();
    }

    let source = match String::from_utf8(filedata) {
        Ok(source) => source,
        Err(_) => {
            error!("transcript upload is not valid UTF-8");
            return ajax_error().into_response();
        }
    };

    let cues = match subs::srt_to_sjson(&source, 1.0) {
        Ok(cues) => cues,
        Err(err) => {
            error!(%err, "failed to convert uploaded transcript");
            return ajax_error().into_response();
        }
    };

    if let Err(err) = save_cues(store, &location, &slug, &cues).await {
        error!(%err, "failed to store transcript artifact");
        return ajax_error().into_response();
    }

    let mut metadata = item.metadata.clone();
    metadata.insert("sub".to_string(), json!(slug));
    if let Err(err) = store.update_metadata(&location, &metadata).await {
        error!(%err, "failed to persist transcript id on item");
        return ajax_error().into_response();
    }

    ajax_success().into_response()
}

async fn download_transcripts(state: &AppState, user: &AuthUser, id: Option<&str>) -> Response {
    let not_found = || json_error(StatusCode::NOT_FOUND, "Transcript not found.").into_response();

    let Some(id) = id.filter(|value| !value.is_empty()) else {
        error!("GET data without `id` property");
        return not_found();
    };

    let location = match Location::parse(id) {
        Ok(location) => location,
        Err(err) => {
            error!(%err, "can't parse item location");
            return not_found();
        }
    };

    let store = state.store();
    let item = match store.get_item(&location).await {
        Ok(item) => item,
        Err(err) if err.is_not_found() => {
            error!(location = %location, "can't find item by location");
            return not_found();
        }
        Err(err) => {
            error!(%err, "failed to load item");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
                .into_response();
        }
    };

    if let Err(err) =
        auth::require_course_access(state, user, &location.org, &location.course).await
    {
        return err.into_response();
    }

    if item.category() != "video" {
        error!("transcripts are supported only for video items");
        return not_found();
    }

    if !item.hosted_speed_ids().is_empty() {
        error!("downloading transcripts of hosted videos is not supported");
        return not_found();
    }

    let Some(sub) = item.sub() else {
        error!("blank `sub` field");
        return not_found();
    };

    let asset = match store
        .find_asset(&location.org, &location.course, &subs::sub_asset_name(sub))
        .await
    {
        Ok(asset) => asset,
        Err(err) if err.is_not_found() => {
            error!("can't find transcript artifact in storage");
            return not_found();
        }
        Err(err) => {
            error!(%err, "failed to load transcript artifact");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
                .into_response();
        }
    };

    let cues: SubCues = match serde_json::from_slice(&asset.content) {
        Ok(cues) => cues,
        Err(err) => {
            error!(%err, "stored transcript artifact is malformed");
            return not_found();
        }
    };

    let srt = match subs::sjson_to_srt(&cues) {
        Ok(srt) => srt,
        Err(err) => {
            error!(%err, "failed to render transcript as SRT");
            return not_found();
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(SRT_CONTENT_TYPE));
    let disposition = format!("attachment; filename=\"{sub}.srt\"");
    let Ok(disposition) = HeaderValue::from_str(&disposition) else {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Invalid download headers.")
            .into_response();
    };
    headers.insert(header::CONTENT_DISPOSITION, disposition);

    (headers, srt).into_response()
}

/// Report transcript presence per candidate source without mutating anything.
async fn check_transcripts(state: &AppState, user: &AuthUser, data: Option<&str>) -> Response {
    let (payload, item) = match validate_transcripts_data(state, user, data).await {
        Ok(validated) => validated,
        Err(response) => return response,
    };
    let store = state.store();
    let location = &item.location;

    let mut presence = TranscriptsPresence {
        html5_local: Vec::new(),
        youtube_local: false,
        youtube_server: false,
        status: "Success",
    };

    if let Some(youtube_id) = first_hosted_id(&payload.videos) {
        presence.youtube_local = transcript_stored(store, location, youtube_id).await;
        // Best-effort probe of the hosting side; failures read as absent.
        presence.youtube_server = state.timedtext().is_available(youtube_id).await;
    }

    for html5_id in html5_candidates(&payload.videos) {
        presence
            .html5_local
            .push(transcript_stored(store, location, &html5_id).await);
    }

    Json(presence).into_response()
}

/// Keep only the chosen html5 candidate's transcript and point the item at it.
async fn choose_transcripts(state: &AppState, user: &AuthUser, data: Option<&str>) -> Response {
    let (payload, item) = match validate_transcripts_data(state, user, data).await {
        Ok(validated) => validated,
        Err(response) => return response,
    };

    let Some(html5_id) = payload.html5_id.as_deref().filter(|id| !id.is_empty()) else {
        error!("transcript choice without an `html5_id`");
        return ajax_error().into_response();
    };

    let store = state.store();
    let location = &item.location;

    for rejected in html5_candidates(&payload.videos)
        .iter()
        .filter(|candidate| candidate.as_str() != html5_id)
    {
        remove_cues(store, location, rejected).await;
    }

    let chosen_sub = subs::slugify(html5_id);
    if item.sub() != Some(chosen_sub.as_str()) {
        let mut metadata = item.metadata.clone();
        metadata.insert("sub".to_string(), json!(chosen_sub));
        if let Err(err) = store.update_metadata(location, &metadata).await {
            error!(%err, "failed to persist chosen transcript id");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
                .into_response();
        }
    }

    ajax_success().into_response()
}

/// Discard the local choice in favor of a hosted source: fetch its transcript,
/// store artifacts for every configured speed, and make it canonical.
async fn replace_transcripts(state: &AppState, user: &AuthUser, data: Option<&str>) -> Response {
    let (payload, item) = match validate_transcripts_data(state, user, data).await {
        Ok(validated) => validated,
        Err(response) => return response,
    };

    let Some(video_id) = first_hosted_id(&payload.videos).map(str::to_string) else {
        error!("transcript replace without a hosted video candidate");
        return ajax_error().into_response();
    };

    let cues = match state.timedtext().fetch_cues(&video_id).await {
        Ok(cues) => cues,
        Err(err) => {
            error!(%err, "failed to fetch hosted transcript");
            return ajax_error().into_response();
        }
    };

    let store = state.store();
    let location = &item.location;

    if let Err(err) = save_cues(store, location, &video_id, &cues).await {
        error!(%err, "failed to store hosted transcript");
        return ajax_error().into_response();
    }

    // Speed variants for every hosted id the item already maps.
    for (speed, speed_id) in item.hosted_speed_ids() {
        if speed_id == video_id {
            continue;
        }
        let scaled = cues.scaled(1.0 / speed);
        if let Err(err) = save_cues(store, location, &speed_id, &scaled).await {
            error!(%err, speed, "failed to store speed-variant transcript");
            return ajax_error().into_response();
        }
    }

    let new_sub = subs::slugify(&video_id);
    let mut metadata = item.metadata.clone();
    metadata.insert("sub".to_string(), json!(new_sub));
    if let Err(err) = store.update_metadata(location, &metadata).await {
        error!(%err, "failed to persist replaced transcript id");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error.")
            .into_response();
    }

    ajax_success().into_response()
}

/// Side-effect pass run after saving a video item: drop artifacts of removed
/// local sources and clear a `sub` that no longer resolves. Best-effort; a
/// failure here never fails the save.
pub async fn manage_video_transcripts(store: &ContentStore, old_item: &Item, new_item: &Item) {
    let location = &new_item.location;
    let remaining: HashSet<String> = new_item.html5_sources().into_iter().collect();

    for source in old_item.html5_sources() {
        if !remaining.contains(&source) {
            remove_cues(store, location, &source).await;
        }
    }

    if let Some(sub) = new_item.sub() {
        match store
            .find_asset(&location.org, &location.course, &subs::sub_asset_name(sub))
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                let mut metadata = new_item.metadata.clone();
                metadata.remove("sub");
                if let Err(err) = store.update_metadata(location, &metadata).await {
                    warn!(%err, "failed to clear stale transcript id");
                }
            }
            Err(err) => warn!(%err, "failed to verify transcript artifact"),
        }
    }
}

async fn transcript_stored(store: &ContentStore, location: &Location, id: &str) -> bool {
    match store
        .find_asset(&location.org, &location.course, &subs::sub_asset_name(id))
        .await
    {
        Ok(_) => true,
        Err(err) if err.is_not_found() => {
            debug!(video_id = %id, "no stored transcript for source");
            false
        }
        Err(err) => {
            warn!(%err, "asset lookup failed during transcript check");
            false
        }
    }
}

async fn save_cues(
    store: &ContentStore,
    location: &Location,
    id: &str,
    cues: &SubCues,
) -> Result<(), SubsError> {
    let content = serde_json::to_vec(cues)
        .map_err(|err| SubsError::new(format!("failed to encode transcript: {err}")))?;
    store
        .save_asset(
            &location.org,
            &location.course,
            &subs::sub_asset_name(id),
            SUBS_CONTENT_TYPE,
            &content,
        )
        .await
        .map_err(|err| SubsError::new(format!("failed to save transcript asset: {err}")))
}

async fn remove_cues(store: &ContentStore, location: &Location, id: &str) {
    match store
        .delete_asset(&location.org, &location.course, &subs::sub_asset_name(id))
        .await
    {
        Ok(removed) => {
            if removed {
                debug!(video_id = %id, "removed transcript artifact");
            }
        }
        Err(err) => warn!(%err, video_id = %id, "failed to remove transcript artifact"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(kind: &str, video: &str) -> VideoSource {
        VideoSource {
            kind: kind.to_string(),
            video: video.to_string(),
        }
    }

    #[test]
    fn every_named_action_parses() {
        assert_eq!(
            TranscriptAction::from_segment("upload"),
            Some(TranscriptAction::Upload)
        );
        assert_eq!(
            TranscriptAction::from_segment("download"),
            Some(TranscriptAction::Download)
        );
        assert_eq!(
            TranscriptAction::from_segment("check"),
            Some(TranscriptAction::Check)
        );
        assert_eq!(
            TranscriptAction::from_segment("choose"),
            Some(TranscriptAction::Choose)
        );
        assert_eq!(
            TranscriptAction::from_segment("replace"),
            Some(TranscriptAction::Replace)
        );
    }

    #[test]
    fn unknown_action_has_no_handler() {
        assert_eq!(TranscriptAction::from_segment("destroy"), None);
        assert_eq!(TranscriptAction::from_segment(""), None);
    }

    #[test]
    fn payload_parses_type_tagged_sources() {
        let payload: TranscriptsPayload = serde_json::from_str(
            r#"{
                "id": "i4x://acme/C/video/a",
                "videos": [
                    {"type": "youtube", "video": "OEoXaMPEzfM", "mode": "youtube"},
                    {"type": "html5", "video": "clip1", "mode": "mp4"}
                ],
                "html5_id": "clip1"
            }"#,
        )
        .unwrap();
        assert_eq!(payload.videos.len(), 2);
        assert_eq!(payload.videos[0].kind, "youtube");
        assert_eq!(payload.html5_id.as_deref(), Some("clip1"));
    }

    #[test]
    fn html5_candidates_dedupe_and_skip_hosted() {
        let videos = vec![
            source("youtube", "OEoXaMPEzfM"),
            source("html5", "clip1"),
            source("html5", "clip1"),
            source("html5", "clip2"),
        ];
        assert_eq!(
            html5_candidates(&videos),
            vec!["clip1".to_string(), "clip2".to_string()]
        );
    }

    #[test]
    fn first_hosted_id_returns_the_video_id() {
        // The id must come from the `video` field, not the type tag.
        let videos = vec![source("html5", "clip1"), source("youtube", "OEoXaMPEzfM")];
        assert_eq!(first_hosted_id(&videos), Some("OEoXaMPEzfM"));
        assert_eq!(first_hosted_id(&[source("html5", "clip1")]), None);
    }

    #[test]
    fn upload_slug_requires_srt_extension() {
        assert_eq!(upload_slug("Welcome Video.srt").unwrap(), "welcome-video");
        assert_eq!(upload_slug("CAPS.SRT").unwrap(), "caps");
        assert!(upload_slug("no-extension").is_err());
        assert!(upload_slug("subs.vtt").is_err());
        assert!(upload_slug("....srt").is_err());
    }
}
