use base64::Engine;
use mime_guess::MimeGuess;
use std::fmt;
use url::Url;

use crate::error::{JobError, ReferenceError};

const DATA_URI_PREFIX: &str = "data:";
const DEFAULT_DATA_MIME: &str = "text/plain";

/// Resource category; decides the `resources/<dir>` a file lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceCategory {
    Css,
    Js,
    Image,
    Font,
    Media,
}

impl ResourceCategory {
    pub const ALL: [ResourceCategory; 5] = [
        ResourceCategory::Css,
        ResourceCategory::Js,
        ResourceCategory::Image,
        ResourceCategory::Font,
        ResourceCategory::Media,
    ];

    /// Subdirectory under `resources/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ResourceCategory::Css => "css",
            ResourceCategory::Js => "js",
            ResourceCategory::Image => "images",
            ResourceCategory::Font => "fonts",
            ResourceCategory::Media => "media",
        }
    }

    /// Singular name, used as the extension of last resort.
    pub fn name(&self) -> &'static str {
        match self {
            ResourceCategory::Css => "css",
            ResourceCategory::Js => "js",
            ResourceCategory::Image => "image",
            ResourceCategory::Font => "font",
            ResourceCategory::Media => "media",
        }
    }

    /// Category for a `url(...)` found in CSS, which can point at anything.
    pub fn for_css_url(path_or_mime: &str, is_mime: bool) -> Self {
        let guessed = if is_mime {
            path_or_mime.parse::<mime::Mime>().ok()
        } else {
            MimeGuess::from_path(path_or_mime).first()
        };

        match guessed {
            Some(m) if m.type_().as_str() == "font" => ResourceCategory::Font,
            Some(m) if m.subtype().as_str().contains("font") => ResourceCategory::Font,
            Some(m) if m.type_() == mime::VIDEO || m.type_() == mime::AUDIO => {
                ResourceCategory::Media
            }
            Some(m) if m.essence_str() == "text/css" => ResourceCategory::Css,
            _ => ResourceCategory::Image,
        }
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEncoding {
    Base64,
    Percent,
}

/// A parsed `data:` URI. Decoding is deferred to [`DataUri::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime: String,
    pub payload: String,
    pub encoding: DataEncoding,
}

impl DataUri {
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let rest = raw
            .get(..DATA_URI_PREFIX.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(DATA_URI_PREFIX))
            .map(|_| &raw[DATA_URI_PREFIX.len()..])
            .ok_or_else(|| ReferenceError::classification(preview(raw), "not a data: URI"))?;

        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| ReferenceError::classification(preview(raw), "missing comma separator"))?;

        let mut params = header.split(';');
        let mime = params.next().unwrap_or("").trim();
        let is_base64 = params.any(|p| p.trim().eq_ignore_ascii_case("base64"));

        Ok(Self {
            mime: if mime.is_empty() {
                DEFAULT_DATA_MIME.to_string()
            } else {
                mime.to_ascii_lowercase()
            },
            payload: payload.to_string(),
            encoding: if is_base64 {
                DataEncoding::Base64
            } else {
                DataEncoding::Percent
            },
        })
    }

    pub fn decode(&self) -> Result<Vec<u8>, ReferenceError> {
        match self.encoding {
            DataEncoding::Base64 => {
                // Base64 payloads in markup are often wrapped or percent-escaped.
                let unescaped = urlencoding::decode_binary(self.payload.as_bytes());
                let cleaned: Vec<u8> = unescaped
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                base64::engine::general_purpose::STANDARD
                    .decode(&cleaned)
                    .map_err(|e| {
                        ReferenceError::classification(
                            preview(&self.payload),
                            format!("invalid base64: {e}"),
                        )
                    })
            }
            DataEncoding::Percent => {
                Ok(urlencoding::decode_binary(self.payload.as_bytes()).into_owned())
            }
        }
    }
}

/// Outcome of classifying a raw reference value.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Data(DataUri),
    Network(Url),
}

#[derive(Debug, Clone)]
pub struct UriClassifier {
    base_url: Url,
}

impl UriClassifier {
    pub fn new(base_url: &str) -> Result<Self, JobError> {
        let base_url = Url::parse(base_url).map_err(|source| JobError::InvalidBaseUrl {
            url: base_url.to_string(),
            source,
        })?;
        Ok(Self { base_url })
    }

    pub fn from_url(base_url: Url) -> Self {
        Self { base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn classify(&self, raw: &str) -> Result<Classified, ReferenceError> {
        let trimmed = raw.trim();
        if is_data_uri(trimmed) {
            return DataUri::parse(trimmed).map(Classified::Data);
        }

        let url = self.resolve_url(trimmed)?;
        match url.scheme() {
            "http" | "https" => Ok(Classified::Network(url)),
            other => Err(ReferenceError::classification(
                trimmed,
                format!("unsupported scheme {other:?}"),
            )),
        }
    }

    pub fn resolve_url(&self, url: &str) -> Result<Url, ReferenceError> {
        let resolved = if url.starts_with("http://") || url.starts_with("https://") {
            Url::parse(url)
        } else if url.starts_with("//") {
            // Protocol-relative URL
            Url::parse(&format!("{}:{}", self.base_url.scheme(), url))
        } else {
            self.base_url.join(url)
        };

        resolved.map_err(|e| ReferenceError::classification(url, e.to_string()))
    }
}

pub fn is_data_uri(value: &str) -> bool {
    value
        .get(..DATA_URI_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(DATA_URI_PREFIX))
}

fn preview(value: &str) -> String {
    let mut end = value.len().min(48);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}
