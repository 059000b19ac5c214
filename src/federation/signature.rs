//! HTTP Signatures for federation requests
//!
//! draft-cavage style signatures over `(request-target) host date [digest]`,
//! RSA-SHA256 with PKCS#1 v1.5 padding.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

/// Maximum tolerated clock skew for the `Date` header, in seconds
pub const MAX_DATE_SKEW_SECS: i64 = 300;

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Host header value the signature was computed over
    pub host: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names, in signing order
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Host header value for a URL, with the port when it is not the scheme default
fn host_header(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Sign an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key` - Instance signing key
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Returns
/// Signature, Date, Host and (for bodies) Digest header values
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key: &RsaPrivateKey,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let host = host_header(&parsed_url)?;

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    // Digest is computed before the body goes back onto the request
    let digest = body.map(generate_digest);

    let mut signing_parts = vec![
        format!(
            "(request-target): {} {}",
            method.to_lowercase(),
            path_and_query
        ),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        host,
        digest,
    })
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::InvalidSignature(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::InvalidSignature(format!("Invalid {} header", name)))
}

/// Parse a public key in SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`) PEM form
pub fn parse_public_key_pem(public_key_pem: &str) -> Result<RsaPublicKey, AppError> {
    RsaPublicKey::from_public_key_pem(public_key_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
        .map_err(|e| AppError::InvalidSignature(format!("Invalid public key: {}", e)))
}

/// Verify an HTTP request signature
///
/// `path` is the path and query as received. Every failure is reported as
/// `InvalidSignature`; none of them panic.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::InvalidSignature(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::InvalidSignature(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::InvalidSignature(
            "Signed headers must include: digest".to_string(),
        ));
    }

    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| AppError::InvalidSignature("Invalid Date format".to_string()))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > MAX_DATE_SKEW_SECS {
        return Err(AppError::InvalidSignature(
            "Date header too old or in future".to_string(),
        ));
    }

    if let Some(body_data) = body {
        if header_str(headers, "digest")? != generate_digest(body_data) {
            return Err(AppError::InvalidSignature("Digest mismatch".to_string()));
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" | "content-type" => {
                header_str(headers, header_name)?.to_string()
            }
            other => {
                return Err(AppError::InvalidSignature(format!(
                    "Unsupported header in signature: {}",
                    other
                )));
            }
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::InvalidSignature("Invalid signature encoding".to_string()))?;

    let public_key = parse_public_key_pem(public_key_pem)?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::InvalidSignature(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature("Signature verification failed".to_string()))
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;
    Ok(parsed.key_id)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// `algorithm` defaults to `hs2019` and `headers` to `date` when absent.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::InvalidSignature("Missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::InvalidSignature("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}
