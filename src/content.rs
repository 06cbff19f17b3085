//! Content Resolver
//!
//! A Version's document arrives through exactly one of four channels,
//! named after the Resource singular (`file` here):
//!
//! - `file`: an inline JSON value
//! - `filebase64`: base64 bytes
//! - `fileurl`: stored elsewhere, raw reads redirect (303)
//! - `fileproxyurl`: stored elsewhere, raw reads fetch and stream it (200)
//!
//! Writing any channel replaces whatever the previous one held. The
//! content type is settled once per write by [`infer_content_type`].

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::blocking::Client;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::{RegistryError, Result};
use crate::store::Row;
use crate::validate::take_key;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Attribute names of the content channels for one Resource type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentNames {
    pub inline: String,
    pub base64: String,
    pub url: String,
    pub proxy_url: String,
}

impl ContentNames {
    pub fn new(singular: &str) -> Self {
        Self {
            inline: singular.to_string(),
            base64: format!("{}base64", singular),
            url: format!("{}url", singular),
            proxy_url: format!("{}proxyurl", singular),
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [&self.inline, &self.base64, &self.url, &self.proxy_url]
    }

    /// `xRegistry-fileurl`
    pub fn url_header(&self) -> String {
        format!("xRegistry-{}", self.url)
    }
}

/// How the current bytes were supplied; reads answer in kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Inline,
    Base64,
}

/// Resolved content of one Version
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentState {
    pub bytes: Option<Vec<u8>>,
    pub url: Option<String>,
    pub proxy_url: Option<String>,
    pub content_type: Option<String>,
    pub encoding: Encoding,
}

const ENCODING_KEY: &str = "contentencoding";

impl ContentState {
    /// Read the content columns of a Version row
    pub fn load(row: &Row, names: &ContentNames) -> Self {
        Self {
            bytes: row.content.clone(),
            url: row.prop_str(&names.url).map(String::from),
            proxy_url: row.prop_str(&names.proxy_url).map(String::from),
            content_type: row.prop_str("contenttype").map(String::from),
            encoding: match row.system_str(ENCODING_KEY) {
                Some("base64") => Encoding::Base64,
                _ => Encoding::Inline,
            },
        }
    }

    /// Write the state back onto a Version row
    pub fn store(&self, row: &mut Row, names: &ContentNames) {
        row.content = self.bytes.clone();
        set_opt(&mut row.props, &names.url, self.url.as_deref());
        set_opt(&mut row.props, &names.proxy_url, self.proxy_url.as_deref());
        set_opt(&mut row.props, "contenttype", self.content_type.as_deref());
        match self.encoding {
            Encoding::Base64 => row.system.insert(ENCODING_KEY.into(), Value::from("base64")),
            Encoding::Inline => row.system.remove(ENCODING_KEY),
        };
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_none() && self.url.is_none() && self.proxy_url.is_none()
    }

    /// Content as a JSON-ish document value, for snapshots and inlining
    pub fn inline_value(&self, names: &ContentNames) -> Option<(String, Value)> {
        let bytes = self.bytes.as_ref()?;
        if self.encoding == Encoding::Inline {
            if self.content_type.as_deref().is_some_and(is_json_content_type) {
                if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
                    return Some((names.inline.clone(), value));
                }
            }
            if let Ok(text) = std::str::from_utf8(bytes) {
                return Some((names.inline.clone(), Value::from(text)));
            }
        }
        Some((names.base64.clone(), Value::from(STANDARD.encode(bytes))))
    }

    /// Add the channel attributes to a structured view
    pub fn render(&self, names: &ContentNames, props: &mut Map<String, Value>, with_body: bool) {
        if let Some(url) = &self.url {
            props.insert(names.url.clone(), Value::from(url.clone()));
        }
        if let Some(proxy) = &self.proxy_url {
            props.insert(names.proxy_url.clone(), Value::from(proxy.clone()));
        }
        if with_body {
            if let Some((name, value)) = self.inline_value(names) {
                props.insert(name, value);
            }
        }
    }
}

fn set_opt(props: &mut Map<String, Value>, name: &str, value: Option<&str>) {
    match value {
        Some(v) => {
            props.insert(name.to_string(), Value::from(v));
        }
        None => {
            props.remove(name);
        }
    }
}

/// The channel a write selected
#[derive(Debug, Clone, PartialEq)]
pub enum Channel {
    Inline(Value),
    Base64(String),
    Url(String),
    ProxyUrl(String),
    Clear,
}

/// Content-related parts of an incoming Version document
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentUpdate {
    /// `None` leaves the stored content alone
    pub channel: Option<Channel>,
    /// `Some(None)` clears the content type
    pub content_type: Option<Option<String>>,
}

impl ContentUpdate {
    /// Remove the channel attributes and `contenttype` from `doc`
    pub fn extract(names: &ContentNames, doc: &mut Map<String, Value>) -> Result<Self> {
        let present: Vec<&str> = names
            .all()
            .into_iter()
            .filter(|n| doc.get(*n).is_some_and(|v| !v.is_null()))
            .collect();
        if present.len() > 1 {
            return Err(RegistryError::structural(format!(
                "Only one of {},{},{} can be present at a time",
                names.inline, names.url, names.base64
            )));
        }

        let string_of = |name: &str, value: Value, kind: &str| -> Result<String> {
            match value {
                Value::String(s) => Ok(s),
                _ => Err(RegistryError::schema(format!(
                    "Attribute \"{}\" must be a {}",
                    name, kind
                ))),
            }
        };

        let mut channel = None;
        if let Some(value) = take_key(doc, &names.inline) {
            channel = Some(if value.is_null() { Channel::Clear } else { Channel::Inline(value) });
        }
        if let Some(value) = take_key(doc, &names.base64) {
            if channel.is_none() || !value.is_null() {
                channel = Some(match value {
                    Value::Null => Channel::Clear,
                    v => match string_of(&names.base64, v, "string")? {
                        s if s.is_empty() => Channel::Clear,
                        s => Channel::Base64(s),
                    },
                });
            }
        }
        if let Some(value) = take_key(doc, &names.url) {
            if !value.is_null() {
                channel = Some(Channel::Url(string_of(&names.url, value, "url")?));
            } else if channel.is_none() {
                channel = Some(Channel::Clear);
            }
        }
        if let Some(value) = take_key(doc, &names.proxy_url) {
            if !value.is_null() {
                channel = Some(Channel::ProxyUrl(string_of(&names.proxy_url, value, "url")?));
            } else if channel.is_none() {
                channel = Some(Channel::Clear);
            }
        }

        let content_type = match take_key(doc, "contenttype") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(v) => Some(Some(string_of("contenttype", v, "string")?)),
        };

        Ok(Self { channel, content_type })
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_none() && self.content_type.is_none()
    }

    /// Resolve against the previous state
    pub fn apply(&self, previous: &ContentState, names: &ContentNames) -> Result<ContentState> {
        let mut next = previous.clone();
        let body = match &self.channel {
            Some(Channel::Inline(value)) => Some(value),
            _ => None,
        };

        if let Some(channel) = &self.channel {
            next = ContentState {
                content_type: previous.content_type.clone(),
                ..ContentState::default()
            };
            match channel {
                Channel::Inline(value) => {
                    next.bytes = Some(match value {
                        Value::String(s) => s.as_bytes().to_vec(),
                        other => canonical_json(other),
                    });
                }
                Channel::Base64(encoded) => {
                    let bytes = STANDARD.decode(encoded.as_bytes()).map_err(|_| {
                        RegistryError::schema(format!(
                            "Attribute \"{}\" must be a base64 encoded string",
                            names.base64
                        ))
                    })?;
                    next.bytes = Some(bytes);
                    next.encoding = Encoding::Base64;
                }
                Channel::Url(url) => next.url = Some(url.clone()),
                Channel::ProxyUrl(url) => next.proxy_url = Some(url.clone()),
                Channel::Clear => {}
            }
        }

        let explicit = self.content_type.as_ref().map(|ct| ct.as_deref());
        next.content_type = infer_content_type(body, explicit, previous.content_type.as_deref());
        Ok(next)
    }
}

/// Settle the content type of a write.
///
/// `explicit` is `Some(None)` when the client nulled `contenttype`.
pub fn infer_content_type(
    body: Option<&Value>,
    explicit: Option<Option<&str>>,
    previous: Option<&str>,
) -> Option<String> {
    match explicit {
        Some(Some(ct)) => Some(ct.to_string()),
        Some(None) => None,
        None => match body {
            Some(Value::String(s)) if !s.is_empty() => previous.map(String::from),
            Some(_) => Some(JSON_CONTENT_TYPE.to_string()),
            None => previous.map(String::from),
        },
    }
}

pub fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == JSON_CONTENT_TYPE || essence.ends_with("+json") || essence == "text/json"
}

/// Compact JSON with object keys sorted
pub fn canonical_json(value: &Value) -> Vec<u8> {
    serde_json::to_vec(&sorted(value)).unwrap_or_default()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

// =============================================================================
// Raw reads
// =============================================================================

/// A raw (non-`$structure`) response for a Resource or Version
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ContentResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A document fetched for a proxy read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Retrieves `fileproxyurl` documents
pub trait ContentFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Fetched>;
}

/// Blocking HTTP fetcher
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| RegistryError::Fetch {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { http })
    }
}

impl ContentFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Fetched> {
        let fail = |reason: String| RegistryError::Fetch {
            url: url.to_string(),
            reason,
        };
        debug!(url, "Fetching proxied content");
        let response = self.http.get(url).send().map_err(|e| fail(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {}", status)));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.bytes().map_err(|e| fail(e.to_string()))?.to_vec();
        Ok(Fetched { body, content_type })
    }
}

/// Build the raw response for `state`; metadata headers are added by the caller
pub fn respond(state: &ContentState, names: &ContentNames, fetcher: &dyn ContentFetcher) -> Result<ContentResponse> {
    let mut response = ContentResponse {
        status: 200,
        ..ContentResponse::default()
    };

    if let Some(url) = &state.url {
        response.status = 303;
        response.headers.push(("Location".into(), url.clone()));
        response.headers.push((names.url_header(), url.clone()));
        return Ok(response);
    }

    if let Some(proxy) = &state.proxy_url {
        let fetched = fetcher.fetch(proxy)?;
        if let Some(ct) = state.content_type.clone().or(fetched.content_type) {
            response.headers.push(("Content-Type".into(), ct));
        }
        response.body = fetched.body;
        return Ok(response);
    }

    if let Some(ct) = &state.content_type {
        response.headers.push(("Content-Type".into(), ct.clone()));
    }
    response.body = state.bytes.clone().unwrap_or_default();
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names() -> ContentNames {
        ContentNames::new("file")
    }

    fn update(doc: Value) -> Result<ContentUpdate> {
        let mut doc = doc.as_object().unwrap().clone();
        ContentUpdate::extract(&names(), &mut doc)
    }

    #[test]
    fn test_one_channel_at_a_time() {
        let err = update(json!({ "file": "x", "fileurl": "http://x" })).unwrap_err();
        assert_eq!(err.to_string(), "Only one of file,fileurl,filebase64 can be present at a time");
        // A null next to a real channel is not a second channel
        assert!(update(json!({ "file": "x", "fileurl": null })).is_ok());
    }

    #[test]
    fn test_extract_removes_keys() {
        let mut doc = json!({ "file": {"a": 1}, "contenttype": "text/plain", "name": "n" })
            .as_object()
            .unwrap()
            .clone();
        let update = ContentUpdate::extract(&names(), &mut doc).unwrap();
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["name"]);
        assert_eq!(update.channel, Some(Channel::Inline(json!({"a": 1}))));
        assert_eq!(update.content_type, Some(Some("text/plain".into())));
    }

    #[test]
    fn test_structured_value_implies_json() {
        let state = update(json!({ "file": { "b": 1, "a": [true] } }))
            .unwrap()
            .apply(&ContentState::default(), &names())
            .unwrap();
        assert_eq!(state.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(state.bytes.as_deref(), Some(&br#"{"a":[true],"b":1}"#[..]));
    }

    #[test]
    fn test_plain_string_keeps_previous_type() {
        let prev = ContentState {
            content_type: Some("text/plain".into()),
            ..ContentState::default()
        };
        let state = update(json!({ "file": "hello" })).unwrap().apply(&prev, &names()).unwrap();
        assert_eq!(state.bytes.as_deref(), Some(&b"hello"[..]));
        assert_eq!(state.content_type.as_deref(), Some("text/plain"));

        let fresh = update(json!({ "file": "hello" })).unwrap().apply(&ContentState::default(), &names()).unwrap();
        assert_eq!(fresh.content_type, None);
    }

    #[test]
    fn test_empty_string_implies_json() {
        assert_eq!(
            infer_content_type(Some(&json!("")), None, None).as_deref(),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            infer_content_type(Some(&json!(5)), Some(Some("text/x")), None).as_deref(),
            Some("text/x")
        );
    }

    #[test]
    fn test_null_contenttype_does_not_reinfer() {
        let prev = ContentState {
            bytes: Some(b"{}".to_vec()),
            content_type: Some(JSON_CONTENT_TYPE.into()),
            ..ContentState::default()
        };
        let state = update(json!({ "contenttype": null })).unwrap().apply(&prev, &names()).unwrap();
        assert_eq!(state.content_type, None);
        assert_eq!(state.bytes, prev.bytes);
    }

    #[test]
    fn test_base64_decode_and_clear() {
        let state = update(json!({ "filebase64": "aGVsbG8=" }))
            .unwrap()
            .apply(&ContentState::default(), &names())
            .unwrap();
        assert_eq!(state.bytes.as_deref(), Some(&b"hello"[..]));
        assert_eq!(state.encoding, Encoding::Base64);

        let cleared = update(json!({ "filebase64": "" })).unwrap().apply(&state, &names()).unwrap();
        assert!(cleared.is_empty());
    }

    #[test]
    fn test_switching_channel_clears_others() {
        let prev = ContentState {
            bytes: Some(b"x".to_vec()),
            ..ContentState::default()
        };
        let state = update(json!({ "fileurl": "http://example.com/doc" }))
            .unwrap()
            .apply(&prev, &names())
            .unwrap();
        assert_eq!(state.bytes, None);
        assert_eq!(state.url.as_deref(), Some("http://example.com/doc"));
    }

    #[test]
    fn test_inline_rendering_follows_encoding() {
        let json_state = ContentState {
            bytes: Some(br#"{"a":1}"#.to_vec()),
            content_type: Some("application/cloudevents+json".into()),
            ..ContentState::default()
        };
        let mut props = Map::new();
        json_state.render(&names(), &mut props, true);
        assert_eq!(props["file"], json!({"a": 1}));

        let binary = ContentState {
            bytes: Some(vec![0xff, 0x00]),
            ..ContentState::default()
        };
        let mut props = Map::new();
        binary.render(&names(), &mut props, true);
        assert_eq!(props["filebase64"], "/wA=");
    }

    struct StaticFetcher;

    impl ContentFetcher for StaticFetcher {
        fn fetch(&self, url: &str) -> Result<Fetched> {
            Ok(Fetched {
                body: format!("from {}", url).into_bytes(),
                content_type: Some("text/plain".into()),
            })
        }
    }

    #[test]
    fn test_raw_responses() {
        let redirect = ContentState {
            url: Some("http://elsewhere/doc".into()),
            ..ContentState::default()
        };
        let response = respond(&redirect, &names(), &StaticFetcher).unwrap();
        assert_eq!(response.status, 303);
        assert_eq!(response.header("location"), Some("http://elsewhere/doc"));
        assert_eq!(response.header("xRegistry-fileurl"), Some("http://elsewhere/doc"));

        let proxied = ContentState {
            proxy_url: Some("http://upstream/doc".into()),
            ..ContentState::default()
        };
        let response = respond(&proxied, &names(), &StaticFetcher).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"from http://upstream/doc");
        assert_eq!(response.header("Location"), None);
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
    }
}
