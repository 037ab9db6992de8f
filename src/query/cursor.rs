//! Opaque continuation tokens
//!
//! A cursor is the sort key of the last item a client has seen, encoded as
//! `v1:{secs}:{nanos}:{node_id}` in unpadded base64url. Nanoseconds are kept so
//! that spans started within the same microsecond still page correctly.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};

use crate::span::SortKey;

const VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(SortKey);

impl Cursor {
    pub fn key(&self) -> &SortKey {
        &self.0
    }

    pub fn encode(&self) -> String {
        let start = self.0.start_time();
        let raw = format!(
            "{}:{}:{}:{}",
            VERSION,
            start.timestamp(),
            start.timestamp_subsec_nanos(),
            self.0.node_id()
        );
        URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(token: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| CursorError::Encoding)?;
        let raw = String::from_utf8(bytes).map_err(|_| CursorError::Encoding)?;

        let mut parts = raw.splitn(4, ':');
        let version = parts.next().unwrap_or_default();
        if version != VERSION {
            return Err(CursorError::UnsupportedVersion(version.to_string()));
        }

        let (Some(secs), Some(nanos), Some(node_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CursorError::Malformed);
        };
        if node_id.is_empty() {
            return Err(CursorError::Malformed);
        }

        let secs: i64 = secs.parse().map_err(|_| CursorError::Malformed)?;
        let nanos: u32 = nanos.parse().map_err(|_| CursorError::Malformed)?;
        let start = DateTime::<Utc>::from_timestamp(secs, nanos).ok_or(CursorError::Malformed)?;

        Ok(Self(SortKey::new(start, node_id)))
    }
}

impl From<SortKey> for Cursor {
    fn from(key: SortKey) -> Self {
        Self(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    #[error("cursor is not valid base64url text")]
    Encoding,
    #[error("unsupported cursor version '{0}'")]
    UnsupportedVersion(String),
    #[error("cursor does not encode a sort position")]
    Malformed,
}
