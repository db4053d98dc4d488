//! S3-style bucket and object routes.
//!
//! Bodies stream in both directions. Replication state is surfaced through
//! `x-amz-meta-*` headers so plain S3 clients can read it with HEAD.

use crate::{
    errors::AppError,
    models::object::Object,
    services::storage_service::{ListObjectsParams, ListObjectsResult, StorageService},
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::SecondsFormat;
use futures::TryStreamExt;
use serde::Deserialize;
use std::{fmt::Write as _, io};
use tokio_util::io::ReaderStream;

/// Header carrying the requested replica count on upload.
pub const REPLICAS_HEADER: &str = "x-amz-meta-replicas";
/// Header reporting `pending` or `active` on GET and HEAD.
pub const REPLICATION_STATUS_HEADER: &str = "x-amz-meta-replication-status";
const CONTENT_MD5_HEADER: &str = "content-md5";
const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";
const MAX_KEYS: usize = 1000;

/// Query params accepted by ListObjectsV2.
#[derive(Debug, Deserialize)]
pub struct ListObjectsV2Query {
    #[serde(rename = "list-type")]
    pub list_type: Option<u8>,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    #[serde(rename = "start-after")]
    pub start_after: Option<String>,
}

fn requested_replicas(headers: &HeaderMap) -> Result<Option<i64>, AppError> {
    let Some(value) = headers.get(REPLICAS_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(Some)
        .ok_or_else(|| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                format!("{REPLICAS_HEADER} must be an integer"),
            )
        })
}

fn quoted_etag(bag_id: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("\"{bag_id}\"")).ok()
}

fn xml_response(status: StatusCode, xml: String) -> Response {
    let mut response = (status, xml).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    response
}

/// PUT `/{bucket}/{*key}`: stage the body, turn it into a bag and answer
/// with the bag id as ETag. Replication happens afterwards.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let replicas = requested_replicas(&headers)?;
    let content_md5 = headers
        .get(CONTENT_MD5_HEADER)
        .and_then(|v| v.to_str().ok());

    let stream = body.into_data_stream().map_err(io::Error::other);
    let object = service
        .upload_object_stream(&bucket, &key, replicas, content_md5, stream)
        .await?;

    let mut response = StatusCode::OK.into_response();
    if let Some(etag) = quoted_etag(&object.bag_id) {
        response.headers_mut().insert(header::ETAG, etag);
    }
    Ok(response)
}

/// GET `/{bucket}/{*key}`. Offloaded objects are restored before the first
/// byte is sent; a restore that outlives the timeout answers 503.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (object, file) = service.get_object_reader(&bucket, &key).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_object_headers(response.headers_mut(), &object);
    Ok(response)
}

/// HEAD `/{bucket}/{*key}`. Never triggers a restore.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let object = service.get_object_metadata(&bucket, &key).await?;
    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &object);
    Ok(response)
}

/// DELETE `/{bucket}/{*key}`
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    service.delete_object(&bucket, &key).await?;

    let mut xml = String::new();
    let _ = write!(
        xml,
        r#"<?xml version="1.0" encoding="UTF-8"?><DeleteResult xmlns="{S3_XMLNS}"><Deleted><Key>{}</Key><DeleteMarker>true</DeleteMarker></Deleted></DeleteResult>"#,
        xml_escape(&key)
    );
    let mut response = xml_response(StatusCode::NO_CONTENT, xml);
    response.headers_mut().insert(
        HeaderName::from_static("x-amz-delete-marker"),
        HeaderValue::from_static("true"),
    );
    Ok(response)
}

/// GET `/{bucket}`: ListObjectsV2 subset (prefix, delimiter, max-keys,
/// continuation-token, start-after).
pub async fn list_objects(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    Query(q): Query<ListObjectsV2Query>,
) -> Result<Response, AppError> {
    if q.list_type.unwrap_or(2) != 2 {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "Only list-type=2 is supported",
        ));
    }

    let params = ListObjectsParams {
        prefix: q.prefix,
        delimiter: q.delimiter,
        continuation_token: q.continuation_token.as_deref().map(decode_continuation_token),
        start_after: q.start_after,
        max_keys: q.max_keys.unwrap_or(MAX_KEYS).clamp(1, MAX_KEYS),
    };

    let result = service.list_objects_v2(&bucket, params.clone()).await?;
    let xml = list_bucket_result_xml(&bucket, &params, q.continuation_token.as_deref(), &result);
    Ok(xml_response(StatusCode::OK, xml))
}

/// PUT `/{bucket}`. Any request body is ignored.
pub async fn create_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
) -> Result<Response, AppError> {
    let created = service.create_bucket(&bucket).await?;
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><CreateBucketResult xmlns="{S3_XMLNS}"><Location>/{}</Location></CreateBucketResult>"#,
        xml_escape(&created.name)
    );
    Ok(xml_response(StatusCode::OK, xml))
}

/// DELETE `/{bucket}`; 409 unless empty.
pub async fn delete_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
) -> Result<StatusCode, AppError> {
    service.delete_bucket(&bucket).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn set_object_headers(headers: &mut HeaderMap, object: &Object) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size_bytes.max(0)));
    if let Some(etag) = quoted_etag(&object.bag_id) {
        headers.insert(header::ETAG, etag);
    }
    if let Ok(modified) = HeaderValue::from_str(&object.created_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, modified);
    }
    headers.insert(
        HeaderName::from_static(REPLICAS_HEADER),
        HeaderValue::from(object.target_replicas),
    );
    headers.insert(
        HeaderName::from_static(REPLICATION_STATUS_HEADER),
        HeaderValue::from_static(object.status.as_str()),
    );
}

fn list_bucket_result_xml(
    bucket: &str,
    params: &ListObjectsParams,
    continuation_token: Option<&str>,
    result: &ListObjectsResult,
) -> String {
    // write! into a String cannot fail
    let mut xml = String::new();
    let _ = write!(
        xml,
        r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult xmlns="{S3_XMLNS}">"#
    );
    let _ = write!(xml, "<Name>{}</Name>", xml_escape(bucket));
    let _ = write!(
        xml,
        "<Prefix>{}</Prefix>",
        xml_escape(params.prefix.as_deref().unwrap_or_default())
    );
    let _ = write!(xml, "<MaxKeys>{}</MaxKeys>", params.max_keys);
    let _ = write!(xml, "<KeyCount>{}</KeyCount>", result.key_count);
    if let Some(token) = continuation_token {
        let _ = write!(xml, "<ContinuationToken>{}</ContinuationToken>", xml_escape(token));
    }
    if let Some(start_after) = &params.start_after {
        let _ = write!(xml, "<StartAfter>{}</StartAfter>", xml_escape(start_after));
    }
    if let Some(delimiter) = &params.delimiter {
        let _ = write!(xml, "<Delimiter>{}</Delimiter>", xml_escape(delimiter));
    }
    let _ = write!(xml, "<IsTruncated>{}</IsTruncated>", result.is_truncated);
    if let Some(next) = &result.next_continuation_token {
        let _ = write!(
            xml,
            "<NextContinuationToken>{}</NextContinuationToken>",
            xml_escape(&encode_continuation_token(next))
        );
    }

    for object in &result.objects {
        let _ = write!(
            xml,
            "<Contents><Key>{}</Key><LastModified>{}</LastModified><ETag>\"{}\"</ETag><Size>{}</Size><StorageClass>STANDARD</StorageClass></Contents>",
            xml_escape(&object.object_key),
            object.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            object.bag_id,
            object.size_bytes,
        );
    }
    for prefix in &result.common_prefixes {
        let _ = write!(
            xml,
            "<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>",
            xml_escape(prefix)
        );
    }

    xml.push_str("</ListBucketResult>");
    xml
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Tokens are the base64 of the last key returned.
fn encode_continuation_token(last_key: &str) -> String {
    STANDARD.encode(last_key)
}

/// Undecodable tokens are taken as a raw key.
fn decode_continuation_token(token: &str) -> String {
    STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn listing(keys: &[&str], truncated: bool) -> ListObjectsResult {
        let objects = keys
            .iter()
            .enumerate()
            .map(|(i, key)| Object {
                id: i as i64 + 1,
                bucket_name: "photos".into(),
                object_key: key.to_string(),
                bag_id: "ab".repeat(32),
                size_bytes: 4,
                target_replicas: 3,
                status: crate::models::object::ObjectStatus::Pending,
                is_local: true,
                created_at: Utc::now(),
            })
            .collect::<Vec<_>>();
        ListObjectsResult {
            key_count: objects.len(),
            next_continuation_token: truncated.then(|| keys[keys.len() - 1].to_string()),
            objects,
            common_prefixes: vec!["2025/".into()],
            is_truncated: truncated,
        }
    }

    #[test]
    fn continuation_tokens_round_trip_and_tolerate_raw_keys() {
        assert_eq!(decode_continuation_token(&encode_continuation_token("a/b c")), "a/b c");
        assert_eq!(decode_continuation_token("not base64!"), "not base64!");
    }

    #[test]
    fn listing_xml_escapes_keys_and_reports_truncation() {
        let params = ListObjectsParams {
            prefix: None,
            delimiter: Some("/".into()),
            continuation_token: None,
            start_after: None,
            max_keys: 1,
        };
        let xml = list_bucket_result_xml("photos", &params, None, &listing(&["a&b.jpg"], true));

        assert!(xml.contains("<Key>a&amp;b.jpg</Key>"));
        assert!(xml.contains("<IsTruncated>true</IsTruncated>"));
        assert!(xml.contains(&format!(
            "<NextContinuationToken>{}</NextContinuationToken>",
            STANDARD.encode("a&b.jpg")
        )));
        assert!(xml.contains("<CommonPrefixes><Prefix>2025/</Prefix></CommonPrefixes>"));
        assert!(xml.ends_with("</ListBucketResult>"));
    }

    #[test]
    fn bad_replica_header_is_rejected() {
        let mut headers = HeaderMap::new();
        assert_eq!(requested_replicas(&headers).unwrap(), None);

        headers.insert(REPLICAS_HEADER, HeaderValue::from_static("5"));
        assert_eq!(requested_replicas(&headers).unwrap(), Some(5));

        headers.insert(REPLICAS_HEADER, HeaderValue::from_static("many"));
        assert_eq!(
            requested_replicas(&headers).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }
}
