use anyhow::Result;
use tapx_core::error::TapError;
use tapx_core::models::{HttpRequestRecord, HttpResponseRecord};

const PROTOCOL: &str = "http";
const MAX_HEADERS: usize = 64;

/// Parse an accumulated ingress buffer as one HTTP/1.x request.
/// Partial headers are malformed: the factory only parses at exchange
/// boundaries, so an incomplete head means bytes went missing.
pub fn parse_request(raw: &[u8]) -> Result<HttpRequestRecord> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let body_start = match request
        .parse(raw)
        .map_err(|e| TapError::malformed(PROTOCOL, format!("request head: {e}")))?
    {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => {
            return Err(TapError::malformed(PROTOCOL, "incomplete request head").into());
        }
    };

    let method = request
        .method
        .ok_or_else(|| TapError::malformed(PROTOCOL, "request without method"))?
        .to_string();
    let path = request
        .path
        .ok_or_else(|| TapError::malformed(PROTOCOL, "request without path"))?
        .to_string();
    let minor = request
        .version
        .ok_or_else(|| TapError::malformed(PROTOCOL, "request without version"))?;
    let headers = collect_headers(request.headers)?;
    let body = extract_body(&headers, &raw[body_start..]);

    Ok(HttpRequestRecord {
        method,
        path,
        http_major: 1,
        http_minor: minor,
        headers,
        body,
    })
}

/// Parse an accumulated egress buffer as one HTTP/1.x response.
pub fn parse_response(raw: &[u8]) -> Result<HttpResponseRecord> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let body_start = match response
        .parse(raw)
        .map_err(|e| TapError::malformed(PROTOCOL, format!("response head: {e}")))?
    {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => {
            return Err(TapError::malformed(PROTOCOL, "incomplete response head").into());
        }
    };

    let status = response
        .code
        .ok_or_else(|| TapError::malformed(PROTOCOL, "response without status code"))?;
    let reason = response.reason.unwrap_or_default().to_string();
    let headers = collect_headers(response.headers)?;
    let body = extract_body(&headers, &raw[body_start..]);

    Ok(HttpResponseRecord {
        status,
        reason,
        headers,
        body,
    })
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<Vec<(String, String)>, TapError> {
    parsed
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| TapError::malformed(PROTOCOL, format!("header {} is not utf-8", h.name)))?;
            Ok((h.name.to_string(), value.to_string()))
        })
        .collect()
}

/// Body extraction honors Content-Length when present and parseable; a
/// captured buffer can be shorter than the declared length if the tracer
/// truncated the stream, in which case the available bytes are kept.
fn extract_body(headers: &[(String, String)], available: &[u8]) -> Vec<u8> {
    let declared = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok());
    match declared {
        Some(len) => available[..len.min(available.len())].to_vec(),
        None => available.to_vec(),
    }
}
