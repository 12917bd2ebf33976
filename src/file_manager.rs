use mime_guess::MimeGuess;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

use crate::classifier::{Classified, DataUri, ResourceCategory};
use crate::error::{JobError, ReferenceError};

pub const RESOURCES_DIR: &str = "resources";

/// A unique resource with its local path decided, before any bytes exist.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedResource {
    /// Absolute URL, or a content hash of the raw data URI.
    pub source_key: String,
    pub source: Classified,
    pub category: ResourceCategory,
    /// Path relative to the mirror root, always `/`-separated.
    pub local_path: String,
}

/// A resource that exists on disk under the mirror root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResource {
    pub source_key: String,
    pub local_path: String,
    pub byte_size: u64,
    pub content_type: String,
}

/// Owns the on-disk layout of one mirror root.
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Creates `<root>/resources/{css,js,images,fonts,media}`.
    pub fn new(root: &Path) -> Result<Self, JobError> {
        for category in ResourceCategory::ALL {
            let dir = root.join(RESOURCES_DIR).join(category.dir_name());
            fs::create_dir_all(&dir).map_err(|source| JobError::OutputDir { path: dir, source })?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute_path(&self, local_path: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in local_path.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    /// Reuses a file left by an earlier run, if one is at the planned path.
    pub fn cached(&self, plan: &PlannedResource) -> Option<ResolvedResource> {
        let path = self.absolute_path(&plan.local_path);
        let metadata = fs::metadata(&path).ok().filter(|m| m.is_file())?;
        debug!(path = %plan.local_path, "cache hit");
        Some(ResolvedResource {
            source_key: plan.source_key.clone(),
            local_path: plan.local_path.clone(),
            byte_size: metadata.len(),
            content_type: guess_content_type(plan, None),
        })
    }

    /// Writes the bytes to the planned path through a `.part` file and a rename,
    /// so a crash never leaves a truncated file that looks like a cache hit.
    pub fn store(
        &self,
        plan: &PlannedResource,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<ResolvedResource, ReferenceError> {
        let path = self.absolute_path(&plan.local_path);
        let mut partial = path.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&partial)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&partial, &path)
        };

        write().map_err(|source| {
            let _ = fs::remove_file(&partial);
            ReferenceError::Write {
                path: path.clone(),
                source,
            }
        })?;

        Ok(ResolvedResource {
            source_key: plan.source_key.clone(),
            local_path: plan.local_path.clone(),
            byte_size: bytes.len() as u64,
            content_type: guess_content_type(plan, content_type),
        })
    }

    /// Path of `local_path` as seen from a document stored at `document`
    /// (both relative to the root).
    pub fn href_from(&self, document: &str, local_path: &str) -> String {
        let target = self.absolute_path(local_path);
        let document_dir = self
            .absolute_path(document)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        pathdiff::diff_paths(&target, &document_dir)
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_else(|| local_path.to_string())
    }
}

/// Assigns local paths to unique resources in the order they are first seen.
///
/// Two different sources that would land on the same file name get a hash
/// suffix on the later one, so a path never belongs to more than one source.
#[derive(Debug, Default)]
pub struct PathPlanner {
    claimed: HashMap<String, String>,
}

impl PathPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&mut self, source: Classified, category: ResourceCategory) -> PlannedResource {
        let source_key = source_key(&source);
        let (stem, extension) = match &source {
            Classified::Network(url) => network_file_name(url, &source_key, category),
            Classified::Data(data) => data_file_name(data, &source_key, category),
        };

        let dir = format!("{}/{}", RESOURCES_DIR, category.dir_name());
        let mut local_path = format!("{dir}/{stem}.{extension}");
        if let Some(owner) = self.claimed.get(&local_path) {
            if owner != &source_key {
                local_path = format!("{dir}/{stem}_{}.{extension}", &content_hash(&source_key)[..8]);
            }
        }
        self.claimed.insert(local_path.clone(), source_key.clone());

        PlannedResource {
            source_key,
            source,
            category,
            local_path,
        }
    }
}

pub fn source_key(source: &Classified) -> String {
    match source {
        Classified::Network(url) => {
            let mut url = url.clone();
            url.set_fragment(None);
            url.to_string()
        }
        Classified::Data(data) => format!(
            "data:{}",
            content_hash(&format!("{};{:?},{}", data.mime, data.encoding, data.payload))
        ),
    }
}

/// Stable hex SHA-256 prefix.
pub fn content_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Replaces characters that are illegal or awkward in file names.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '%' | '#' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect()
}

fn network_file_name(
    url: &Url,
    source_key: &str,
    category: ResourceCategory,
) -> (String, String) {
    let last_segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    let decoded = urlencoding::decode(last_segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last_segment.to_string());
    let file_name = sanitize_file_name(&decoded);
    let file_name = file_name.trim_matches('.');

    if file_name.is_empty() {
        return (
            format!("resource_{}", content_hash(source_key)),
            category.name().to_string(),
        );
    }

    let path = Path::new(file_name);
    match path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase()) {
        Some(ext) if MimeGuess::from_ext(&ext).first().is_some() => {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name.to_string());
            (stem, ext)
        }
        _ => (file_name.to_string(), category.name().to_string()),
    }
}

fn data_file_name(data: &DataUri, source_key: &str, category: ResourceCategory) -> (String, String) {
    let hash = source_key.trim_start_matches("data:");
    let extension = extension_for_mime(&data.mime)
        .map(str::to_string)
        .unwrap_or_else(|| category.name().to_string());
    (format!("data_uri_{hash}"), extension)
}

/// Preferred extension for a MIME type.
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" => Some("jpg"),
        "image/svg+xml" => Some("svg"),
        "image/x-icon" | "image/vnd.microsoft.icon" => Some("ico"),
        "text/javascript" | "application/javascript" => Some("js"),
        "text/plain" => Some("txt"),
        other => mime_guess::get_mime_extensions_str(other).and_then(|exts| exts.first().copied()),
    }
}

fn guess_content_type(plan: &PlannedResource, reported: Option<&str>) -> String {
    if let Some(reported) = reported.filter(|r| !r.is_empty()) {
        return reported.to_string();
    }
    match &plan.source {
        Classified::Data(data) => data.mime.clone(),
        Classified::Network(_) => MimeGuess::from_path(&plan.local_path)
            .first_or_octet_stream()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::UriClassifier;
    use tempfile::tempdir;

    fn classify(raw: &str) -> Classified {
        UriClassifier::new("https://example.com/page/")
            .unwrap()
            .classify(raw)
            .unwrap()
    }

    #[test]
    fn test_new_creates_category_directories() {
        let temp_dir = tempdir().unwrap();
        LocalStore::new(temp_dir.path()).unwrap();

        for dir in ["css", "js", "images", "fonts", "media"] {
            assert!(temp_dir.path().join("resources").join(dir).is_dir(), "missing {dir}");
        }
    }

    #[test]
    fn test_plan_uses_last_path_segment() {
        let mut planner = PathPlanner::new();
        let plan = planner.plan(classify("/static/a.png?v=3"), ResourceCategory::Image);

        assert_eq!(plan.local_path, "resources/images/a.png");
        assert_eq!(plan.source_key, "https://example.com/static/a.png?v=3");
    }

    #[test]
    fn test_plan_falls_back_to_category_extension() {
        let mut planner = PathPlanner::new();

        let no_ext = planner.plan(classify("/api/logo"), ResourceCategory::Image);
        assert_eq!(no_ext.local_path, "resources/images/logo.image");

        let empty = planner.plan(classify("/fonts/"), ResourceCategory::Font);
        assert!(empty.local_path.starts_with("resources/fonts/resource_"));
        assert!(empty.local_path.ends_with(".font"));
    }

    #[test]
    fn test_plan_decodes_and_sanitizes_file_names() {
        let mut planner = PathPlanner::new();
        let plan = planner.plan(classify("/img/my%20photo%3A1.jpg"), ResourceCategory::Image);
        assert_eq!(plan.local_path, "resources/images/my_photo_1.jpg");
    }

    #[test]
    fn test_plan_disambiguates_colliding_names() {
        let mut planner = PathPlanner::new();
        let first = planner.plan(classify("/a/logo.png"), ResourceCategory::Image);
        let second = planner.plan(classify("/b/logo.png"), ResourceCategory::Image);
        let again = planner.plan(classify("/a/logo.png"), ResourceCategory::Image);

        assert_eq!(first.local_path, "resources/images/logo.png");
        assert_ne!(second.local_path, first.local_path);
        assert!(second.local_path.starts_with("resources/images/logo_"));
        assert_eq!(again.local_path, first.local_path);
    }

    #[test]
    fn test_data_uri_plan_is_content_addressed() {
        let mut planner = PathPlanner::new();
        let a = planner.plan(classify("data:image/png;base64,AAAA"), ResourceCategory::Image);
        let b = planner.plan(classify("data:image/png;base64,AAAA"), ResourceCategory::Image);
        let c = planner.plan(classify("data:image/png;base64,BBBB"), ResourceCategory::Image);

        assert_eq!(a.source_key, b.source_key);
        assert_eq!(a.local_path, b.local_path);
        assert_ne!(a.local_path, c.local_path);
        assert!(a.local_path.starts_with("resources/images/data_uri_"));
        assert!(a.local_path.ends_with(".png"));
    }

    #[test]
    fn test_store_then_cached() {
        let temp_dir = tempdir().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();
        let plan = PathPlanner::new().plan(classify("/style.css"), ResourceCategory::Css);

        assert!(store.cached(&plan).is_none());

        let resolved = store.store(&plan, b"body{}", Some("text/css")).unwrap();
        assert_eq!(resolved.byte_size, 6);
        assert_eq!(resolved.content_type, "text/css");
        assert_eq!(
            fs::read(temp_dir.path().join("resources/css/style.css")).unwrap(),
            b"body{}"
        );
        assert!(!temp_dir.path().join("resources/css/style.css.part").exists());

        let cached = store.cached(&plan).unwrap();
        assert_eq!(cached.byte_size, 6);
        assert_eq!(cached.local_path, "resources/css/style.css");
    }

    #[test]
    fn test_href_from_nested_document() {
        let temp_dir = tempdir().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();

        assert_eq!(
            store.href_from("index.html", "resources/images/a.png"),
            "resources/images/a.png"
        );
        assert_eq!(
            store.href_from("pages/about.html", "resources/images/a.png"),
            "../resources/images/a.png"
        );
    }

    #[test]
    fn test_sanitize_file_name() {
        let test_cases = vec![
            ("normal.png", "normal.png"),
            ("with space.png", "with_space.png"),
            ("a<b>c:d\"e|f?g*h.css", "a_b_c_d_e_f_g_h.css"),
            ("back\\slash.js", "back_slash.js"),
        ];

        for (input, expected) in test_cases {
            assert_eq!(sanitize_file_name(input), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_extension_for_mime() {
        assert_eq!(extension_for_mime("image/png"), Some("png"));
        assert_eq!(extension_for_mime("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for_mime("image/svg+xml;charset=utf-8"), Some("svg"));
        assert_eq!(extension_for_mime("application/x-nothing-known"), None);
    }
}
