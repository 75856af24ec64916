//! HAR 1.2 archive model, one page per capture session and one entry per
//! completed REST transaction. Two custom extension fields are carried:
//! `response.content._file` points at a saved body relative to the archive
//! base, and `response._redacted` marks entries written with secret
//! redaction enabled.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The archive records the protocol as HTTP/2.0 throughout; the navigation
/// host does not expose the negotiated version.
pub const HTTP_VERSION: &str = "HTTP/2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Har {
    pub log: Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub version: String,
    pub creator: Creator,
    pub pages: Vec<Page>,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub started_date_time: String,
    pub id: String,
    pub title: String,
    pub page_timings: PageTimings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTimings {
    pub on_content_load: i64,
    pub on_load: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub pageref: String,
    pub started_date_time: String,
    /// Total elapsed time in milliseconds.
    pub time: u64,
    pub request: Request,
    pub response: Response,
    pub cache: Cache,
    pub timings: Timings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub cookies: Vec<NameValue>,
    pub headers: Vec<NameValue>,
    pub query_string: Vec<NameValue>,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<PostData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub mime_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub cookies: Vec<NameValue>,
    pub headers: Vec<NameValue>,
    pub content: Content,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(rename = "_redacted", skip_serializing_if = "Option::is_none")]
    pub redacted: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Saved body, relative to the archive base directory.
    #[serde(rename = "_file", skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cache {}

/// Phase timings; phases the host cannot observe are zero, not null.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timings {
    pub send: i64,
    pub wait: i64,
    pub receive: i64,
}

/// RFC3339 rendering of a millisecond epoch timestamp.
pub fn iso_date_time(epoch_ms: u64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(epoch_ms as i64)
        .single()
        .unwrap_or_default();
    dt.to_rfc3339()
}

impl Har {
    /// Fresh archive with a single page representing the session.
    pub fn new(page_title: &str, started_ms: u64) -> Self {
        Har {
            log: Log {
                version: "1.2".to_string(),
                creator: Creator {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                pages: vec![Page {
                    started_date_time: iso_date_time(started_ms),
                    id: "page_1".to_string(),
                    title: page_title.to_string(),
                    page_timings: PageTimings::default(),
                }],
                entries: Vec::new(),
            },
        }
    }
}
