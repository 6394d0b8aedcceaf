//! Firmware update plumbing shared by the targets.
//!
//! Pushed images arrive on `POST /update`: browsers post `multipart/form-data`,
//! curl and scripts send the raw binary. [`UploadFilter`] turns either stream
//! into image bytes, chunk by chunk, without buffering the whole upload.
//!
//! Pulled images are named by `POST /api/ota` ([`OtaPullRequest`]) and fetched
//! by the device itself.

use serde::Deserialize;

use crate::error::PanelError;

const MAX_PART_HEADER: usize = 4096;
const HEADER_END: &[u8] = b"\r\n\r\n";
const DEFAULT_OTA_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// Body of `POST /api/ota`: a full `url`, or `host` + `path` with an optional
/// `port`. `sha256` pins the expected image digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OtaPullRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl OtaPullRequest {
    pub fn parse(body: &[u8]) -> Result<Self, PanelError> {
        let request: Self = serde_json::from_slice(body)
            .map_err(|err| PanelError::InvalidArgument(format!("invalid OTA request: {err}")))?;
        if let Some(digest) = request.sha256.as_deref() {
            let digest = digest.trim();
            if digest.len() != 64 || !digest.bytes().all(|byte| byte.is_ascii_hexdigit()) {
                return Err(PanelError::InvalidArgument(
                    "sha256 must be 64 hex characters".to_string(),
                ));
            }
        }
        Ok(request)
    }

    /// Resolves the download location; an explicit `url` wins over `host`.
    pub fn firmware_url(&self) -> Result<String, PanelError> {
        if let Some(url) = self.url.as_deref().map(str::trim) {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(PanelError::InvalidArgument(format!(
                    "unsupported OTA url: {url}"
                )));
            }
            return Ok(url.to_string());
        }

        match (self.host.as_deref().map(str::trim), self.path.as_deref()) {
            (Some(host), Some(path)) if !host.is_empty() => Ok(firmware_url(
                host,
                path.trim(),
                self.port.unwrap_or(DEFAULT_OTA_PORT),
            )),
            _ => Err(PanelError::InvalidArgument(
                "OTA request needs url, or host and path".to_string(),
            )),
        }
    }
}

/// Port 443 maps to an `https` URL without an explicit port.
pub fn firmware_url(host: &str, path: &str, port: u16) -> String {
    let slash = if path.starts_with('/') { "" } else { "/" };
    if port == HTTPS_PORT {
        format!("https://{host}{slash}{path}")
    } else {
        format!("http://{host}:{port}{slash}{path}")
    }
}

/// Case-insensitive comparison of a pinned digest against a computed one.
pub fn digest_matches(expected: &str, actual_hex: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual_hex)
}

#[derive(Debug)]
enum Stage {
    Raw,
    PartHeader,
    Body,
    Done,
}

#[derive(Debug)]
pub struct UploadFilter {
    stage: Stage,
    delimiter: Vec<u8>,
    pending: Vec<u8>,
}

impl UploadFilter {
    pub fn raw() -> Self {
        Self {
            stage: Stage::Raw,
            delimiter: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn multipart(boundary: Option<&str>) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        if let Some(boundary) = boundary {
            delimiter.extend_from_slice(boundary.as_bytes());
        }
        Self {
            stage: Stage::PartHeader,
            delimiter,
            pending: Vec::new(),
        }
    }

    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(value) if value.to_ascii_lowercase().contains("multipart/form-data") => {
                Self::multipart(boundary_param(value))
            }
            _ => Self::raw(),
        }
    }

    pub fn is_multipart(&self) -> bool {
        !matches!(self.stage, Stage::Raw)
    }

    /// Feeds one received chunk and returns the image bytes ready to write.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>, PanelError> {
        match self.stage {
            Stage::Raw => Ok(chunk.to_vec()),
            Stage::Done => Ok(Vec::new()),
            Stage::PartHeader => {
                self.pending.extend_from_slice(chunk);
                let Some(end) = find(&self.pending, HEADER_END) else {
                    if self.pending.len() > MAX_PART_HEADER {
                        return Err(PanelError::InvalidArgument(
                            "multipart part header too large".to_string(),
                        ));
                    }
                    return Ok(Vec::new());
                };
                let body = self.pending.split_off(end + HEADER_END.len());
                self.pending.clear();
                self.stage = Stage::Body;
                self.push(&body)
            }
            Stage::Body => {
                self.pending.extend_from_slice(chunk);
                if let Some(end) = find(&self.pending, &self.delimiter) {
                    self.pending.truncate(end);
                    self.stage = Stage::Done;
                    return Ok(std::mem::take(&mut self.pending));
                }
                let keep = self.delimiter.len().saturating_sub(1);
                let ready = self.pending.len().saturating_sub(keep);
                let tail = self.pending.split_off(ready);
                Ok(std::mem::replace(&mut self.pending, tail))
            }
        }
    }

    /// Flushes what is left once the request body is exhausted.
    pub fn finish(mut self) -> Result<Vec<u8>, PanelError> {
        match self.stage {
            Stage::PartHeader => Err(PanelError::InvalidArgument(
                "multipart body ended before part data".to_string(),
            )),
            _ => Ok(std::mem::take(&mut self.pending)),
        }
    }
}

fn boundary_param(content_type: &str) -> Option<&str> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"'))
            .filter(|value| !value.is_empty())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
