//! Just enough HTTP/1.1 to talk to Spine.
//!
//! Spine's message handling service speaks a narrow, well-behaved subset of
//! HTTP: single request per connection, explicit Content-Length, no chunked
//! transfer coding. Parsing that by hand keeps the wire handling in one
//! place and avoids pulling a full client/server stack into the transport.

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// A parsed HTTP start line plus header fields.
///
/// Field names are uppercased on insert so lookups are case-insensitive, as
/// RFC 7230 requires. Folded continuation lines are appended to the previous
/// field's value.
pub struct HttpHeaders {
    pub start_line: String,
    fields: FxHashMap<String, String>,
}

impl HttpHeaders {
    /// Read the start line and header block from a stream, stopping after the
    /// blank line. The body is left unread.
    pub async fn read<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<HttpHeaders> {
        let mut raw = String::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(anyhow!("connection closed before end of HTTP headers"));
            }
            if line == "\r\n" || line == "\n" {
                break;
            }
            raw.push_str(&line);
        }
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<HttpHeaders> {
        let mut lines = raw.lines();
        let start_line = lines
            .next()
            .ok_or_else(|| anyhow!("empty HTTP header block"))?
            .trim_end()
            .to_string();
        if start_line.is_empty() {
            return Err(anyhow!("empty HTTP start line"));
        }

        let mut fields: FxHashMap<String, String> = FxHashMap::default();
        let mut last_key: Option<String> = None;
        for line in lines {
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // folded continuation of the previous field
                if let Some(ref key) = last_key {
                    if let Some(v) = fields.get_mut(key) {
                        v.push(' ');
                        v.push_str(line.trim());
                    }
                }
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(anyhow!("malformed HTTP header line: {}", line));
            };
            let key = name.trim().to_uppercase();
            fields.insert(key.clone(), value.trim().to_string());
            last_key = Some(key);
        }
        Ok(HttpHeaders { start_line, fields })
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(&name.to_uppercase()).map(|s| s.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.field("Content-Length").and_then(|v| v.parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.field("Content-Type")
    }

    pub fn host(&self) -> Option<&str> {
        self.field("Host")
    }

    /// The SOAPAction field with surrounding quotes stripped.
    ///
    /// Some Spine-facing test tools double up the URN prefix when they build
    /// the action ("urn:urn:..."). That is corrected here rather than being
    /// left for every caller to notice.
    pub fn soap_action(&self) -> Option<String> {
        let raw = self.field("SOAPAction")?;
        let trimmed = raw.trim_matches('"');
        let fixed = if let Some(rest) = trimmed.strip_prefix("urn:urn:") {
            format!("urn:{}", rest)
        } else {
            trimmed.to_string()
        };
        Some(fixed)
    }

    /// The status code, when the start line is an HTTP response.
    pub fn status_code(&self) -> Option<u16> {
        if !self.start_line.starts_with("HTTP/") {
            return None;
        }
        self.start_line.split_whitespace().nth(1)?.parse().ok()
    }

    /// The request target, when the start line is an HTTP request.
    pub fn request_path(&self) -> Option<&str> {
        if self.start_line.starts_with("HTTP/") {
            return None;
        }
        self.start_line.split_whitespace().nth(1)
    }
}

/// Split an http(s) URL into (host, port, path).
///
/// Ports default to 80 / 443 by scheme, and an empty path becomes "/".
pub fn parse_url(url: &str) -> anyhow::Result<(String, u16, String)> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| anyhow!("URL has no scheme: {}", url))?;
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return Err(anyhow!("unsupported URL scheme: {}", scheme)),
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };
    if authority.is_empty() {
        return Err(anyhow!("URL has no host: {}", url));
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse::<u16>().map_err(|_| anyhow!("bad port in URL: {}", url))?),
        None => (authority.to_string(), default_port),
    };
    Ok((host, port, path))
}

/// Extract the bare MIME boundary token from a multipart Content-Type.
pub fn parse_mime_boundary(content_type: &str) -> Option<String> {
    let idx = content_type.to_lowercase().find("boundary=")?;
    let after = &content_type[idx + "boundary=".len()..];
    let after = after.split(';').next()?.trim();
    let bare = after.trim_matches('"');
    if bare.is_empty() {
        return None;
    }
    Some(bare.to_string())
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn parse(raw: &str) -> HttpHeaders {
        HttpHeaders::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_request() {
        let h = parse(
            "POST /reliablemessaging/intermediary HTTP/1.1\r\n\
             Host: spine.example\r\n\
             content-length: 123\r\n\
             SOAPAction: \"urn:nhs:names:services:pdsquery/QUPA_IN000006UK02\"\r\n",
        );
        assert_eq!(h.request_path(), Some("/reliablemessaging/intermediary"));
        assert_eq!(h.status_code(), None);
        assert_eq!(h.host(), Some("spine.example"));
        assert_eq!(h.content_length(), Some(123));
        assert_eq!(
            h.soap_action().unwrap(),
            "urn:nhs:names:services:pdsquery/QUPA_IN000006UK02"
        );
    }

    #[test]
    fn test_parse_response() {
        let h = parse("HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n");
        assert_eq!(h.status_code(), Some(202));
        assert_eq!(h.request_path(), None);
    }

    #[test]
    fn test_doubled_urn_prefix_is_fixed() {
        let h = parse("POST / HTTP/1.1\r\nSOAPAction: \"urn:urn:nhs:names:services:pdsquery/x\"\r\n");
        assert_eq!(h.soap_action().unwrap(), "urn:nhs:names:services:pdsquery/x");
    }

    #[test]
    fn test_folded_header_line() {
        let h = parse("POST / HTTP/1.1\r\nX-Long: first\r\n second\r\n");
        assert_eq!(h.field("x-long"), Some("first second"));
    }

    #[rstest]
    #[case("https://spine.example/reliablemessaging/intermediary", "spine.example", 443, "/reliablemessaging/intermediary")]
    #[case("http://spine.example:8080/x", "spine.example", 8080, "/x")]
    #[case("http://spine.example", "spine.example", 80, "/")]
    fn test_parse_url(
        #[case] url: &str,
        #[case] host: &str,
        #[case] port: u16,
        #[case] path: &str,
    ) {
        let (h, p, pa) = parse_url(url).unwrap();
        assert_eq!(h, host);
        assert_eq!(p, port);
        assert_eq!(pa, path);
    }

    #[test]
    fn test_parse_url_rejects_garbage() {
        assert!(parse_url("spine.example/x").is_err());
        assert!(parse_url("ftp://spine.example/x").is_err());
    }

    #[test]
    fn test_mime_boundary() {
        assert_eq!(
            parse_mime_boundary("multipart/related; boundary=\"abc=_123\"; type=\"text/xml\"").unwrap(),
            "abc=_123"
        );
        assert_eq!(
            parse_mime_boundary("multipart/related; boundary=plain").unwrap(),
            "plain"
        );
        assert_eq!(parse_mime_boundary("text/xml"), None);
    }
}
