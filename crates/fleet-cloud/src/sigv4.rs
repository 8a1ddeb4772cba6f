use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::credentials::AwsCredentials;

type HmacSha256 = Hmac<Sha256>;

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Extract the hostname from a URL (scheme://host/path → host).
pub(crate) fn url_host(url: &str) -> &str {
    let without_scheme = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    match without_scheme.find('/') {
        Some(pos) => &without_scheme[..pos],
        None => without_scheme,
    }
}

/// Percent-encodes a value for the EC2 Query API's form-urlencoded body.
pub(crate) fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            b => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Build SigV4 request headers for an AWS API call.
///
/// Returns a `BTreeMap` of headers to add to the request. Caller must also
/// set `Content-Type` and `Host`.
pub(crate) fn sigv4_headers(
    method: &str,
    uri_path: &str,
    query_string: &str,
    content_type: &str,
    body: &[u8],
    creds: &AwsCredentials,
    region: &str,
    service: &str,
    host: &str,
) -> BTreeMap<String, String> {
    let now = chrono::Utc::now();
    let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let payload_hash = sha256_hex(body);

    let mut canon_hdrs: BTreeMap<String, String> = BTreeMap::new();
    canon_hdrs.insert("content-type".into(), content_type.into());
    canon_hdrs.insert("host".into(), host.into());
    canon_hdrs.insert("x-amz-content-sha256".into(), payload_hash.clone());
    canon_hdrs.insert("x-amz-date".into(), timestamp.clone());
    if let Some(ref token) = creds.session_token {
        canon_hdrs.insert("x-amz-security-token".into(), token.clone());
    }

    let signed_headers: String = canon_hdrs.keys().cloned().collect::<Vec<_>>().join(";");
    let canonical_headers: String = canon_hdrs
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, uri_path, query_string, canonical_headers, signed_headers, payload_hash
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        timestamp,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date, region, service);
    let signature = hmac_sha256(&signing_key, string_to_sign.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();

    let auth = format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        creds.access_key_id, scope, signed_headers, signature
    );

    let mut out = BTreeMap::new();
    out.insert("Authorization".into(), auth);
    out.insert("x-amz-date".into(), timestamp);
    out.insert("x-amz-content-sha256".into(), payload_hash);
    if let Some(ref token) = creds.session_token {
        out.insert("x-amz-security-token".into(), token.clone());
    }
    out
}
