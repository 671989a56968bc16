use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const FALLBACK_CATEGORY: &str = "general";
const DISPLAY_ID_WIDTH: usize = 4;

/// Raw asset record as the CDN's admin API returns it. The public id is the
/// only key ever used to address the asset; width and height are
/// authoritative for aspect-ratio decisions.
#[derive(Debug, Clone, Deserialize)]
pub struct CdnResource {
    pub public_id: String,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub secure_url: Option<String>,
}

/// Display-ready read model computed fresh on every listing call and never
/// persisted. `display_id` is positional within the current listing and must
/// not be treated as stable across requests; `public_id` and `asset_id` are
/// the stable handles.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedWallpaper {
    pub id: String,
    pub display_id: String,
    pub public_id: String,
    pub title: String,
    pub slug: String,
    pub category: String,
    pub resolution: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Every field has a deterministic fallback; this never fails.
pub fn normalize(resource: &CdnResource, ordinal_index: usize) -> NormalizedWallpaper {
    NormalizedWallpaper {
        id: resource
            .asset_id
            .clone()
            .unwrap_or_else(|| resource.public_id.clone()),
        display_id: format!("{ordinal_index:0width$}", width = DISPLAY_ID_WIDTH),
        public_id: resource.public_id.clone(),
        title: derive_title(&resource.public_id),
        slug: derive_slug(&resource.public_id),
        category: derive_category(resource),
        resolution: format!("{}x{}", resource.width, resource.height),
        tags: resource.tags.clone(),
        format: resource.format.clone(),
        bytes: resource.bytes,
        created_at: resource
            .created_at
            .and_then(|stamp| stamp.format(&Rfc3339).ok()),
        url: resource.secure_url.clone(),
    }
}

/// Tag-cases the last path segment of the public id, extension stripped.
fn derive_title(public_id: &str) -> String {
    let segment = public_id.rsplit('/').next().unwrap_or(public_id);
    let stem = match segment.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => segment,
    };
    stem.replace(['-', '_'], " ")
        .split_whitespace()
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Lowercases the public id and collapses every run of non-alphanumerics
/// into a single hyphen.
fn derive_slug(public_id: &str) -> String {
    let mut slug = String::with_capacity(public_id.len());
    let mut pending_hyphen = false;
    for ch in public_id.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch);
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Listings are ordered by caller-visible creation time, newest first; the
/// CDN's response order carries no meaning. Undated resources sort last.
pub fn sort_by_created_desc(resources: &mut [CdnResource]) {
    resources.sort_by(|a, b| match (b.created_at, a.created_at) {
        (Some(b_at), Some(a_at)) => b_at.cmp(&a_at),
        (Some(_), None) => std::cmp::Ordering::Greater,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// Folder beats tags beats the fallback literal.
fn derive_category(resource: &CdnResource) -> String {
    if let Some(folder) = resource.folder.as_deref() {
        if let Some(last) = folder.rsplit('/').find(|segment| !segment.is_empty()) {
            return last.to_lowercase();
        }
    }
    if let Some(tag) = resource.tags.first() {
        if !tag.is_empty() {
            return tag.to_lowercase();
        }
    }
    FALLBACK_CATEGORY.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(public_id: &str) -> CdnResource {
        CdnResource {
            public_id: public_id.to_string(),
            asset_id: None,
            width: 1920,
            height: 1080,
            bytes: 0,
            format: None,
            created_at: None,
            tags: Vec::new(),
            folder: None,
            secure_url: None,
        }
    }

    #[test]
    fn normalizes_title_slug_and_display_id() {
        let view = normalize(&resource("cats/fluffy cat.png"), 0);
        assert_eq!(view.title, "Fluffy Cat");
        assert_eq!(view.slug, "cats-fluffy-cat-png");
        assert_eq!(view.display_id, "0000");
        assert_eq!(view.resolution, "1920x1080");
    }

    #[test]
    fn title_replaces_separators_and_capitalizes() {
        assert_eq!(derive_title("nature/misty_mountain-dawn.jpg"), "Misty Mountain Dawn");
        assert_eq!(derive_title("plain"), "Plain");
    }

    #[test]
    fn slug_collapses_runs_and_trims_hyphens() {
        assert_eq!(derive_slug("__Neon--City  (2024)!.png"), "neon-city-2024-png");
        assert_eq!(derive_slug("///"), "");
    }

    #[test]
    fn category_prefers_folder_then_tag_then_fallback() {
        let mut with_folder = resource("x");
        with_folder.folder = Some("wallpapers/nature/Forest".to_string());
        with_folder.tags = vec!["green".to_string(), "calm".to_string()];
        assert_eq!(derive_category(&with_folder), "forest");

        let mut with_tags = resource("x");
        with_tags.tags = vec!["green".to_string()];
        assert_eq!(derive_category(&with_tags), "green");

        assert_eq!(derive_category(&resource("x")), "general");
    }

    #[test]
    fn sort_orders_newest_first_with_undated_last() {
        let mut t1 = resource("t1");
        t1.created_at = Some(OffsetDateTime::from_unix_timestamp(1_000).unwrap());
        let mut t2 = resource("t2");
        t2.created_at = Some(OffsetDateTime::from_unix_timestamp(2_000).unwrap());
        let mut t3 = resource("t3");
        t3.created_at = Some(OffsetDateTime::from_unix_timestamp(3_000).unwrap());
        let undated = resource("undated");

        let mut resources = vec![t2, undated, t3, t1];
        sort_by_created_desc(&mut resources);
        let order: Vec<_> = resources.iter().map(|r| r.public_id.as_str()).collect();
        assert_eq!(order, vec!["t3", "t2", "t1", "undated"]);
    }

    #[test]
    fn display_id_tracks_ordinal_position() {
        let view = normalize(&resource("a"), 41);
        assert_eq!(view.display_id, "0041");
    }

    #[test]
    fn id_falls_back_to_public_id_without_asset_id() {
        let mut with_asset = resource("folder/pic");
        with_asset.asset_id = Some("abc123".to_string());
        assert_eq!(normalize(&with_asset, 0).id, "abc123");
        assert_eq!(normalize(&resource("folder/pic"), 0).id, "folder/pic");
    }

    #[test]
    fn resource_deserializes_admin_api_shape() {
        let json = serde_json::json!({
            "asset_id": "b5e6d2b39ba3e0869d67141ba7dba6cf",
            "public_id": "wallpapers/nature/forest-dawn",
            "format": "png",
            "width": 3840,
            "height": 2160,
            "bytes": 4_194_304,
            "created_at": "2024-03-01T12:00:00Z",
            "tags": ["green", "calm"],
            "folder": "wallpapers/nature",
            "secure_url": "https://res.cloudinary.com/demo/image/upload/wallpapers/nature/forest-dawn.png"
        });
        let resource: CdnResource = serde_json::from_value(json).unwrap();
        assert_eq!(resource.width, 3840);
        assert_eq!(resource.tags.len(), 2);
        assert!(resource.created_at.is_some());
    }

    #[test]
    fn resource_tolerates_sparse_records() {
        let resource: CdnResource =
            serde_json::from_value(serde_json::json!({ "public_id": "lonely" })).unwrap();
        let view = normalize(&resource, 3);
        assert_eq!(view.category, "general");
        assert_eq!(view.resolution, "0x0");
        assert!(view.tags.is_empty());
    }
}
