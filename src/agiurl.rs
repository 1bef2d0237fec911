//! Parsing of the `agi_request` URL.
//!
//! Asterisk passes the dialplan's AGI argument through verbatim, so the URL is
//! the natural place to carry per-call parameters:
//! `exten => 1000,3,AGI(agi://127.0.0.1:4573/menu?lang=en&retries=3)`.
use std::collections::HashMap;

use url::form_urlencoded;
use url::Url;

use crate::AGIParseError;

/// A parsed AGI request URL of the form
/// `agi://host[:port]/seg1/seg2?k1=v1&k2=v2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AGIUrl {
    pub host: String,
    pub port: Option<u16>,
    /// Non-empty path segments, in order.
    pub path: Vec<String>,
    /// Percent-decoded query parameters. A key without `=` maps to the empty
    /// string. Order is not preserved.
    pub params: HashMap<String, String>,
}
impl AGIUrl {
    /// Parse an AGI request URL. Absent query and absent trailing slash are
    /// accepted; the scheme is not validated.
    pub fn parse(input: &str) -> Result<AGIUrl, AGIParseError> {
        let parsed =
            Url::parse(input).map_err(|_| AGIParseError::UrlUnparsable(input.to_owned()))?;
        let path = parsed
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_owned())
                    .collect()
            })
            .unwrap_or_default();
        let params = parsed.query_pairs().into_owned().collect();
        Ok(AGIUrl {
            host: parsed.host_str().unwrap_or("").to_owned(),
            port: parsed.port(),
            path,
            params,
        })
    }
}
impl std::fmt::Display for AGIUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "agi://{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "/{}", self.path.join("/"))?;
        if !self.params.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.params.iter())
                .finish();
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}
