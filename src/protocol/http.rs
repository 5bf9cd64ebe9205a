use crate::protocol::{ByteQueue, QueueClosed};

/// Minimal HTTP/1.1 request handling for the families that tunnel their
/// protocol through HTTP shapes. Only what those implants emit is
/// parsed: a request line, headers, a Content-Length body, cookies, and
/// form values in the query string, urlencoded bodies, or multipart
/// parts.

const MAX_LINE_SIZE: usize = 8192;
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("queue is closed")]
    Closed(#[from] QueueClosed),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("body too large: {0} bytes")]
    BodyTooLarge(usize),
}

#[derive(Debug)]
pub struct Request {
    #[allow(dead_code)]
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct FormFile {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Read one request from the byte stream, blocking on the queue until a
/// full head and body have arrived.
pub fn read_request(queue: &ByteQueue) -> Result<Request, HttpError> {
    let request_line = read_line(queue)?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| HttpError::Malformed("empty request line".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| HttpError::Malformed("request line missing target".into()))?
        .to_string();

    let mut headers = Vec::new();
    loop {
        let line = read_line(queue)?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Malformed(format!("bad header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut req = Request {
        method,
        target,
        headers,
        body: Vec::new(),
    };

    let content_length = req
        .header("Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_SIZE {
        return Err(HttpError::BodyTooLarge(content_length));
    }
    if content_length > 0 {
        req.body = queue.get(content_length)?;
    }

    Ok(req)
}

fn read_line(queue: &ByteQueue) -> Result<String, HttpError> {
    let mut line = Vec::new();

    loop {
        let b = queue.get(1)?[0];
        if b == b'\n' {
            break;
        }
        line.push(b);
        if line.len() > MAX_LINE_SIZE {
            return Err(HttpError::Malformed("header line too long".into()));
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    String::from_utf8(line).map_err(|_| HttpError::Malformed("non-utf8 header line".into()))
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        let header = self.header("Cookie")?;
        for pair in header.split(';') {
            if let Some((n, v)) = pair.split_once('=') {
                if n.trim() == name {
                    return Some(v.trim().to_string());
                }
            }
        }
        None
    }

    /// Look a form value up the way the implants expect: query string
    /// first, then an urlencoded body, then multipart parts.
    pub fn form_value(&self, name: &str) -> Option<String> {
        if let Some(query) = self.target.split_once('?').map(|(_, q)| q) {
            if let Some(v) = urlencoded_value(query, name) {
                return Some(v);
            }
        }

        match self.header("Content-Type").map(str::to_string) {
            Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => {
                let body = String::from_utf8_lossy(&self.body);
                urlencoded_value(&body, name)
            }
            Some(ct) if ct.starts_with("multipart/form-data") => {
                let boundary = boundary_from_content_type(&ct)?;
                let part = multipart_part(&self.body, &boundary, name)?;
                Some(String::from_utf8_lossy(&part.1).to_string())
            }
            _ => None,
        }
    }

    /// Extract an uploaded multipart file part by field name.
    pub fn form_file(&self, name: &str) -> Option<FormFile> {
        let ct = self.header("Content-Type")?;
        if !ct.starts_with("multipart/form-data") {
            return None;
        }
        let boundary = boundary_from_content_type(ct)?;
        let (filename, data) = multipart_part(&self.body, &boundary, name)?;
        Some(FormFile {
            filename: filename.unwrap_or_default(),
            data,
        })
    }
}

/// Serialise a plain 200 response carrying the given body.
pub fn simple_response(body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(body);
    out
}

fn urlencoded_value(query: &str, name: &str) -> Option<String> {
    for pair in query.split('&') {
        let (n, v) = pair.split_once('=').unwrap_or((pair, ""));
        if percent_decode(n) == name {
            return Some(percent_decode(v));
        }
    }
    None
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                match (hi, lo) {
                    (Some(h), Some(l)) => {
                        out.push((h * 16 + l) as u8);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).to_string()
}

fn boundary_from_content_type(ct: &str) -> Option<String> {
    for param in ct.split(';') {
        let (n, v) = match param.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        if n.trim().eq_ignore_ascii_case("boundary") {
            return Some(v.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// Find the multipart part whose Content-Disposition names the given
/// field. Returns the optional filename and the part body.
fn multipart_part(body: &[u8], boundary: &str, name: &str) -> Option<(Option<String>, Vec<u8>)> {
    let delimiter = format!("--{boundary}");
    let mut rest = body;

    // Skip any preamble before the first delimiter.
    let start = find(rest, delimiter.as_bytes())?;
    rest = &rest[start + delimiter.len()..];

    loop {
        if rest.starts_with(b"--") {
            return None;
        }
        rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);

        // Part headers end at the blank line.
        let head_end = find(rest, b"\r\n\r\n")?;
        let head = String::from_utf8_lossy(&rest[..head_end]).to_string();
        let content = &rest[head_end + 4..];

        let next = find(content, delimiter.as_bytes())?;
        let mut part_body = &content[..next];
        if part_body.ends_with(b"\r\n") {
            part_body = &part_body[..part_body.len() - 2];
        }

        let mut part_name = None;
        let mut filename = None;
        for line in head.lines() {
            if let Some(rest) = line
                .strip_prefix("Content-Disposition:")
                .or_else(|| line.strip_prefix("content-disposition:"))
            {
                for param in rest.split(';') {
                    let (n, v) = match param.split_once('=') {
                        Some(pair) => pair,
                        None => continue,
                    };
                    let v = v.trim().trim_matches('"').to_string();
                    match n.trim() {
                        "name" => part_name = Some(v),
                        "filename" => filename = Some(v),
                        _ => {}
                    }
                }
            }
        }

        if part_name.as_deref() == Some(name) {
            return Some((filename, part_body.to_vec()));
        }

        rest = &content[next + delimiter.len()..];
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
