//! Function URL event envelope.
//!
//! When a client calls a function URL, the platform maps the raw HTTP request
//! to an event object before it reaches the function. See
//! <https://docs.aws.amazon.com/lambda/latest/dg/urls-invocation.html>.
//!
//! The body is always base64 encoded and `isBase64Encoded` is always `true`;
//! no attempt is made to tell text from binary.

use crate::error::TranslateError;
use axum::http::{HeaderMap, Method, Uri, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;

/// The HTTP sub-object of the request context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpContext {
    /// Request method.
    pub method: String,
    /// Same value as `rawPath`.
    pub path: String,
}

/// Request context of a function URL event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// The `Host` the request was sent to.
    pub domain_name: String,
    /// The first label of a dotted host, otherwise empty.
    pub domain_prefix: String,
    /// Method and path.
    pub http: HttpContext,
}

/// A raw HTTP request expressed as a function URL event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Request method.
    pub method: String,
    /// `/` followed by the path matched by the catch-all route.
    pub raw_path: String,
    /// Query string as received, without the `?`.
    pub raw_query_string: String,
    /// Decoded query parameters; repeated keys are comma-joined.
    pub query_string_parameters: BTreeMap<String, String>,
    /// Request headers other than `Host`; repeated headers are comma-joined.
    pub headers: BTreeMap<String, String>,
    /// Request context.
    pub request_context: RequestContext,
    /// Base64 of the request body.
    pub body: String,
    /// Always `true`.
    pub is_base64_encoded: bool,
}

impl EventEnvelope {
    /// Builds an envelope from request parts.
    ///
    /// `wildcard` is the remainder captured by the catch-all route, without
    /// its leading `/`.
    pub fn from_parts(
        method: &Method,
        wildcard: &str,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Self {
        let raw_path = format!("/{wildcard}");
        let host = request_host(uri, headers);
        let raw_query_string = uri.query().unwrap_or_default().to_string();

        Self {
            method: method.to_string(),
            raw_path: raw_path.clone(),
            query_string_parameters: query_parameters(&raw_query_string),
            raw_query_string,
            headers: joined_headers(headers),
            request_context: RequestContext {
                domain_prefix: domain_prefix(&host).to_string(),
                domain_name: host,
                http: HttpContext {
                    method: method.to_string(),
                    path: raw_path,
                },
            },
            body: STANDARD.encode(body),
            is_base64_encoded: true,
        }
    }

    /// Serialises the envelope into an invocation payload.
    ///
    /// # Errors
    ///
    /// Returns [`TranslateError::Serialize`] if JSON encoding fails.
    pub fn to_payload(&self) -> Result<Bytes, TranslateError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes `body` back into the original request bytes.
    pub fn decoded_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.body)
    }
}

/// The `Host` header, falling back to the URI authority.
fn request_host(uri: &Uri, headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Everything before the first `.` of a dotted host, otherwise empty.
pub fn domain_prefix(host: &str) -> &str {
    match host.split_once('.') {
        Some((prefix, _)) => prefix,
        None => "",
    }
}

/// Decodes a query string, comma-joining repeated keys in arrival order.
pub fn query_parameters(raw_query: &str) -> BTreeMap<String, String> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
        grouped
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    grouped
        .into_iter()
        .map(|(key, values)| (key, values.join(",")))
        .collect()
}

/// Comma-joins repeated header values in arrival order.
///
/// `Host` is left out; it is carried as `requestContext.domainName`.
pub fn joined_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .keys()
        .filter(|name| **name != header::HOST)
        .map(|name| {
            let joined = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(",");
            (name.as_str().to_string(), joined)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use proptest::prelude::*;
    use serde_json::json;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_function_url_scenario() {
        let uri: Uri = "/foo?x=1&x=2".parse().unwrap();
        let headers = headers(&[("host", "abc.lambda-url.us-east-1.on.aws")]);

        let envelope = EventEnvelope::from_parts(&Method::POST, "foo", &uri, &headers, b"");

        assert_eq!(envelope.request_context.domain_prefix, "abc");
        assert_eq!(
            envelope.request_context.domain_name,
            "abc.lambda-url.us-east-1.on.aws"
        );
        assert_eq!(envelope.raw_path, "/foo");
        assert_eq!(envelope.raw_query_string, "x=1&x=2");
        assert_eq!(
            envelope.query_string_parameters,
            BTreeMap::from([("x".to_string(), "1,2".to_string())])
        );
        assert_eq!(envelope.request_context.http.method, "POST");
        assert_eq!(envelope.request_context.http.path, "/foo");
    }

    #[test]
    fn test_undotted_host_has_empty_prefix() {
        assert_eq!(domain_prefix("localhost:8080"), "");
        assert_eq!(domain_prefix("127.0.0.1:8080"), "127");
        assert_eq!(domain_prefix(""), "");
    }

    #[test]
    fn test_repeated_headers_are_joined() {
        let headers = headers(&[
            ("host", "localhost:8080"),
            ("x-custom", "a"),
            ("x-custom", "b"),
            ("x-custom", "c"),
            ("content-type", "application/json"),
        ]);

        let joined = joined_headers(&headers);

        assert!(!joined.contains_key("host"));
        assert_eq!(joined.get("x-custom").map(String::as_str), Some("a,b,c"));
        assert_eq!(
            joined.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn test_query_is_percent_decoded() {
        let params = query_parameters("name=J%C3%B6rg&msg=hello+world&flag");
        assert_eq!(params["name"], "Jörg");
        assert_eq!(params["msg"], "hello world");
        assert_eq!(params["flag"], "");
    }

    #[test]
    fn test_wire_format() {
        let uri: Uri = "/orders/42?expand=items".parse().unwrap();
        let headers = headers(&[("host", "localhost:8080")]);

        let envelope =
            EventEnvelope::from_parts(&Method::PUT, "orders/42", &uri, &headers, b"{\"a\":1}");
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.to_payload().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "method": "PUT",
                "rawPath": "/orders/42",
                "rawQueryString": "expand=items",
                "queryStringParameters": {"expand": "items"},
                "headers": {},
                "requestContext": {
                    "domainName": "localhost:8080",
                    "domainPrefix": "",
                    "http": {"method": "PUT", "path": "/orders/42"}
                },
                "body": "eyJhIjoxfQ==",
                "isBase64Encoded": true
            })
        );
    }

    #[test]
    fn test_root_path_and_empty_query() {
        let uri: Uri = "/".parse().unwrap();
        let envelope =
            EventEnvelope::from_parts(&Method::POST, "", &uri, &HeaderMap::new(), b"");

        assert_eq!(envelope.raw_path, "/");
        assert_eq!(envelope.raw_query_string, "");
        assert!(envelope.query_string_parameters.is_empty());
        assert_eq!(envelope.body, "");
        assert!(envelope.is_base64_encoded);
    }

    proptest! {
        #[test]
        fn body_is_base64_of_original_bytes(body in proptest::collection::vec(any::<u8>(), 0..512)) {
            let uri: Uri = "/".parse().unwrap();
            let envelope = EventEnvelope::from_parts(&Method::POST, "", &uri, &HeaderMap::new(), &body);

            prop_assert!(envelope.is_base64_encoded);
            prop_assert_eq!(envelope.decoded_body().unwrap(), body);
        }

        #[test]
        fn repeated_query_values_join_in_order(values in proptest::collection::vec("[a-z0-9]{1,6}", 1..6)) {
            let raw = values
                .iter()
                .map(|v| format!("k={v}"))
                .collect::<Vec<_>>()
                .join("&");

            let params = query_parameters(&raw);
            prop_assert_eq!(params.get("k").cloned(), Some(values.join(",")));
        }

        #[test]
        fn repeated_header_values_join_in_order(values in proptest::collection::vec("[a-zA-Z0-9]{1,8}", 1..6)) {
            let mut map = HeaderMap::new();
            for v in &values {
                map.append("x-repeat", HeaderValue::from_str(v).unwrap());
            }

            let joined = joined_headers(&map);
            prop_assert_eq!(joined.get("x-repeat").cloned(), Some(values.join(",")));
        }
    }
}
