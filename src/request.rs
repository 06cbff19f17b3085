//! Request dispatch
//!
//! Maps a verb plus a path onto registry operations, the way a transport
//! layer would. Errors become `<status>` responses whose body is the
//! literal message followed by a newline.

use serde_json::Value;
use std::fmt;

use crate::error::{RegistryError, Result};
use crate::path::XPath;
use crate::registry::{ReadOptions, Registry, WriteMethod, WriteOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Patch,
    Post,
    Delete,
}

impl Method {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            other => Err(RegistryError::MethodNotAllowed(format!("{} not allowed", other))),
        }
    }

    fn write_method(&self) -> Option<WriteMethod> {
        match self {
            Method::Put => Some(WriteMethod::Put),
            Method::Patch => Some(WriteMethod::Patch),
            Method::Post => Some(WriteMethod::Post),
            Method::Get | Method::Delete => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Split `path?a=b&c` into path and query pairs
    pub fn parse(method: Method, target: &str) -> Self {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let mut request = Self::new(method, path);
        request.query = query
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        request
    }

    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = body.to_string().into_bytes();
        self.headers.push(("Content-Type".into(), "application/json".into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn query(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    fn json(status: u16, value: &Value) -> Result<Self> {
        let mut body = serde_json::to_vec_pretty(value)?;
        body.push(b'\n');
        Ok(Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body,
        })
    }

    fn error(err: &RegistryError) -> Self {
        Self {
            status: err.status(),
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: format!("{}\n", err).into_bytes(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json_body(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Handle one request; never fails, errors become responses
pub fn dispatch(registry: &Registry, request: &Request) -> Response {
    handle(registry, request).unwrap_or_else(|err| Response::error(&err))
}

fn handle(registry: &Registry, request: &Request) -> Result<Response> {
    let (path, structure) = XPath::parse_request(&request.path)?;
    let raw = !structure && is_document(registry, &path);

    match request.method {
        Method::Get => {
            if path == XPath::Model {
                let model = registry.render_model(request.query("schema"))?;
                return Response::json(200, &model);
            }
            if raw {
                let content = registry.get_raw(&path)?;
                return Ok(Response {
                    status: content.status,
                    headers: content.headers,
                    body: content.body,
                });
            }
            let opts = ReadOptions::from_query(&request.query)?;
            Response::json(200, &registry.get(&path, &opts)?)
        }
        Method::Delete => {
            let opts = WriteOptions::from_query(&request.query)?;
            let batch = parse_body(&request.body)?;
            registry.delete(&path, batch.as_ref(), &opts)?;
            Ok(Response {
                status: 204,
                ..Response::default()
            })
        }
        method => {
            let write = method
                .write_method()
                .ok_or_else(|| RegistryError::MethodNotAllowed(format!("{} not allowed on \"{}\"", method, path)))?;
            let opts = WriteOptions::from_query(&request.query)?;
            let written = if raw {
                registry.write_raw(write, &path, &request.headers, &request.body, &opts)?
            } else {
                let doc = parse_body(&request.body)?.unwrap_or(Value::Null);
                registry.write(write, &path, &doc, &opts)?
            };
            let status = if written.created { 201 } else { 200 };
            let mut response = Response::json(status, &written.value)?;
            if written.created {
                let location = format!(
                    "{}{}",
                    registry.settings().base_url.trim_end_matches('/'),
                    written.location
                );
                response.headers.push(("Location".into(), location));
            }
            Ok(response)
        }
    }
}

fn parse_body(body: &[u8]) -> Result<Option<Value>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(body)?))
}

/// Resource and Version paths of document-bearing types answer with the
/// document unless `$structure` is asked for
fn is_document(registry: &Registry, path: &XPath) -> bool {
    let rref = match path {
        XPath::Resource(r) | XPath::Version(r, _) => r,
        _ => return false,
    };
    registry
        .model()
        .resource(&rref.group.plural, &rref.plural)
        .is_some_and(|r| r.has_document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Registry {
        let registry = Registry::in_memory().unwrap();
        registry
            .set_model(&json!({
                "groups": { "dirs": { "plural": "dirs", "singular": "dir",
                    "resources": { "files": { "plural": "files", "singular": "file" } } } }
            }))
            .unwrap();
        registry
    }

    #[test]
    fn test_parse_query() {
        let request = Request::parse(Method::Get, "/dirs/d1?inline=files&compact");
        assert_eq!(request.path, "/dirs/d1");
        assert_eq!(request.query("inline"), Some("files"));
        assert_eq!(request.query("compact"), Some(""));
    }

    #[test]
    fn test_put_on_collection_not_allowed() {
        let reg = registry();
        let response = dispatch(&reg, &Request::new(Method::Put, "/dirs").with_json(&json!({})));
        assert_eq!(response.status, 405);
        assert_eq!(response.text(), "PUT not allowed on \"/dirs\"\n");
    }

    #[test]
    fn test_create_then_read_group() {
        let reg = registry();
        let created = dispatch(&reg, &Request::new(Method::Put, "/dirs/d1").with_json(&json!({ "name": "one" })));
        assert_eq!(created.status, 201);
        assert_eq!(created.header("Location"), Some("http://localhost:8080/dirs/d1"));

        let read = dispatch(&reg, &Request::new(Method::Get, "/dirs/d1"));
        let body = read.json_body().unwrap();
        assert_eq!(body["dirid"], "d1");
        assert_eq!(body["name"], "one");
        assert_eq!(body["epoch"], 1);
        assert_eq!(body["filescount"], 0);
    }

    #[test]
    fn test_raw_document_round_trip() {
        let reg = registry();
        let put = Request::new(Method::Put, "/dirs/d1/files/f1")
            .with_header("Content-Type", "text/plain")
            .with_header("xRegistry-name", "readme")
            .with_body("hello");
        assert_eq!(dispatch(&reg, &put).status, 201);

        let raw = dispatch(&reg, &Request::new(Method::Get, "/dirs/d1/files/f1"));
        assert_eq!(raw.status, 200);
        assert_eq!(raw.body, b"hello");
        assert_eq!(raw.header("xRegistry-name"), Some("readme"));
        assert_eq!(raw.header("Content-Type"), Some("text/plain"));

        let meta = dispatch(&reg, &Request::new(Method::Get, "/dirs/d1/files/f1$structure"));
        let body = meta.json_body().unwrap();
        assert_eq!(body["versionid"], "1");
        assert_eq!(body["contenttype"], "text/plain");
    }

    #[test]
    fn test_errors_end_with_newline() {
        let reg = registry();
        let response = dispatch(&reg, &Request::new(Method::Get, "/dirs/nope"));
        assert_eq!(response.status, 404);
        assert_eq!(response.text(), "Group \"nope\" not found\n");
    }
}
