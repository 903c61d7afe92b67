//! Origin gate for browser callers
//!
//! Only pages served from a workspace subdomain of the configured
//! control-plane host may call the local API:
//!
//! ```text
//! [<port>-]<workspace id>.<label>.<control-plane host>[:<port>]
//! ```
//!
//! The workspace id is either UUID shaped or a `word-word-suffix` id. The
//! `<port>-` prefix is only accepted when port-based exposure is enabled.

use regex::Regex;

const UUID_ID: &str = "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";
const WORD_ID: &str = "[0-9a-z]{2,16}-[0-9a-z]{2,16}-[0-9a-z]{4,8}";

/// Decides which `Origin` header values are allowed
#[derive(Debug, Clone)]
pub struct OriginGate {
    pattern: Regex,
}

impl OriginGate {
    /// Build the gate for a control-plane host name
    pub fn new(host: &str, allow_port_prefix: bool) -> Result<Self, regex::Error> {
        let port_prefix = if allow_port_prefix { "(?:[0-9]+-)?" } else { "" };
        let pattern = format!(
            r"^{}(?:{}|{})\.[^.]+\.{}(?::[0-9]+)?$",
            port_prefix,
            UUID_ID,
            WORD_ID,
            regex::escape(host)
        );
        Ok(Self {
            pattern: Regex::new(&pattern)?,
        })
    }

    /// Whether `origin` (a full `Origin` header value) is allowed
    pub fn allows(&self, origin: &str) -> bool {
        let Some(rest) = origin
            .strip_prefix("https://")
            .or_else(|| origin.strip_prefix("http://"))
        else {
            return false;
        };
        self.pattern.is_match(rest)
    }
}
