/// Minimal HTTP/1.x client used for directory fetches and `http_get`
use super::ByteStream;
use minitor_common::{Result, TorError};
use tracing::debug;

const MAX_HEADERS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub version: HttpVersion,
    pub host: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// `GET` with `Host` and `Connection: close`
    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            version: HttpVersion::Http11,
            host: host.into(),
            path: path.into(),
            headers: Vec::new(),
        }
    }

    /// Directory requests use HTTP/1.0 like the directory servers expect
    pub fn directory(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            version: HttpVersion::Http10,
            ..Self::get(host, path)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let version = match self.version {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        };
        let path = if self.path.is_empty() { "/" } else { &self.path };
        let mut out = format!("GET {path} {version}\r\nHost: {}\r\n", self.host);
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("Connection: close\r\n\r\n");
        out.into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// First header with `name`, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parses a complete response, undoing chunked and deflate encodings
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut header_buf);
        let header_len = match response.parse(raw) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                return Err(TorError::http("response ended inside the headers"))
            }
            Err(e) => return Err(TorError::http(format!("malformed response: {e}"))),
        };

        let status = response
            .code
            .ok_or_else(|| TorError::http("missing status code"))?;
        let reason = response.reason.unwrap_or_default().to_string();
        let headers: Vec<(String, String)> = response
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect();

        let mut parsed = Self {
            status,
            reason,
            headers,
            body: Vec::new(),
        };

        let mut body = raw[header_len..].to_vec();
        if parsed
            .header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            body = decode_chunked(&body)?;
        } else if let Some(length) = parsed.header("Content-Length").and_then(|v| v.parse::<usize>().ok()) {
            if body.len() > length {
                body.truncate(length);
            } else if body.len() < length {
                debug!("Response body shorter than Content-Length ({} < {})", body.len(), length);
            }
        }

        if parsed
            .header("Content-Encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("deflate"))
        {
            body = inflate_zlib(&body)?;
        }

        parsed.body = body;
        Ok(parsed)
    }
}

/// Decompresses a zlib stream, the encoding of `.z` directory documents
pub fn inflate_zlib(data: &[u8]) -> Result<Vec<u8>> {
    miniz_oxide::inflate::decompress_to_vec_zlib(data)
        .map_err(|e| TorError::http(format!("zlib inflate failed: {e:?}")))
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = find_crlf(data).ok_or_else(|| TorError::http("truncated chunk header"))?;
        let size_line = std::str::from_utf8(&data[..line_end])
            .map_err(|_| TorError::http("invalid chunk header"))?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| TorError::http(format!("invalid chunk size {size_hex:?}")))?;
        data = &data[line_end + 2..];

        if size == 0 {
            return Ok(out);
        }
        if data.len() < size {
            return Err(TorError::http("truncated chunk"));
        }
        out.extend_from_slice(&data[..size]);
        data = data.get(size + 2..).unwrap_or_default();
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Writes `request` to `stream` and reads the full response
pub async fn fetch<S: ByteStream + ?Sized>(
    stream: &mut S,
    request: &HttpRequest,
    limit: usize,
) -> Result<HttpResponse> {
    stream.write_all(&request.to_bytes()).await?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw, limit).await?;
    if raw.is_empty() {
        return Err(TorError::http("empty response"));
    }
    HttpResponse::parse(&raw)
}
