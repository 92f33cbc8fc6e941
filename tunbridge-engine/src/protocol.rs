//! Control-plane message grammar
//!
//! Messages are UTF-8 text. The canonical form is
//!
//! ```text
//! METHOD|||PATH|||BODY
//! ```
//!
//! where `BODY` may be empty or missing. Older controlling processes send
//! either a bare token (`setMode:<mode>`, `getMode`, `ping`, `stats`,
//! `restart`) or the
//! colon form `METHOD:PATH[:BODY]`, where `PATH` starts with `/` so it cannot
//! be confused with `setMode:`. Both are still accepted.

/// Canonical field delimiter
pub const DELIMITER: &str = "|||";

/// A proxied administrative request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// HTTP method, upper case
    pub method: String,
    /// Request path, starting with `/`
    pub path: String,
    /// Request body, possibly empty
    pub body: String,
}

impl ApiRequest {
    pub fn new(method: &str, path: &str, body: &str) -> Self {
        let path = path.trim();
        Self {
            method: method.trim().to_ascii_uppercase(),
            path: if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{}", path)
            },
            body: body.to_string(),
        }
    }
}

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `setMode:<mode>`
    SetMode(String),
    /// `getMode`
    GetMode,
    /// `ping`
    Ping,
    /// `stats`
    Stats,
    /// `restart`: stop, settle and start again from the last configuration
    Restart,
    /// Anything forwarded to the proxy core's controller
    Api(ApiRequest),
}

impl ControlMessage {
    /// Decode a message, returning `None` for an unrecognized format
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();

        match trimmed {
            "getMode" => return Some(ControlMessage::GetMode),
            "ping" => return Some(ControlMessage::Ping),
            "stats" => return Some(ControlMessage::Stats),
            "restart" => return Some(ControlMessage::Restart),
            _ => {}
        }
        if let Some(mode) = trimmed.strip_prefix("setMode:") {
            return Some(ControlMessage::SetMode(mode.trim().to_string()));
        }

        parse_canonical(text).or_else(|| parse_colon(trimmed))
    }

    /// Encode in the form a current bridge expects
    pub fn encode(&self) -> String {
        match self {
            ControlMessage::SetMode(mode) => format!("setMode:{}", mode),
            ControlMessage::GetMode => "getMode".to_string(),
            ControlMessage::Ping => "ping".to_string(),
            ControlMessage::Stats => "stats".to_string(),
            ControlMessage::Restart => "restart".to_string(),
            ControlMessage::Api(req) => format!(
                "{}{}{}{}{}",
                req.method, DELIMITER, req.path, DELIMITER, req.body
            ),
        }
    }
}

fn parse_canonical(text: &str) -> Option<ControlMessage> {
    let mut fields = text.splitn(3, DELIMITER);
    let method = fields.next()?.trim();
    let path = fields.next()?;
    let body = fields.next().unwrap_or("");

    if !is_method(method) {
        return None;
    }
    Some(ControlMessage::Api(ApiRequest::new(method, path, body)))
}

fn parse_colon(text: &str) -> Option<ControlMessage> {
    let mut fields = text.splitn(3, ':');
    let method = fields.next()?;
    let path = fields.next()?;
    let body = fields.next().unwrap_or("");

    if !is_method(method) || !path.starts_with('/') {
        return None;
    }
    Some(ControlMessage::Api(ApiRequest::new(method, path, body)))
}

fn is_method(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(method: &str, path: &str, body: &str) -> Option<ControlMessage> {
        Some(ControlMessage::Api(ApiRequest::new(method, path, body)))
    }

    #[test]
    fn test_bare_tokens() {
        assert_eq!(ControlMessage::parse("ping"), Some(ControlMessage::Ping));
        assert_eq!(ControlMessage::parse("getMode\n"), Some(ControlMessage::GetMode));
        assert_eq!(ControlMessage::parse("stats"), Some(ControlMessage::Stats));
        assert_eq!(ControlMessage::parse(" restart "), Some(ControlMessage::Restart));
        assert_eq!(ControlMessage::Restart.encode(), "restart");
        assert_eq!(
            ControlMessage::parse("setMode:global"),
            Some(ControlMessage::SetMode("global".into()))
        );
    }

    #[test]
    fn test_canonical_form() {
        assert_eq!(ControlMessage::parse("GET|||/version|||"), api("GET", "/version", ""));
        assert_eq!(ControlMessage::parse("GET|||/version"), api("GET", "/version", ""));
        assert_eq!(
            ControlMessage::parse("PUT|||/proxies/GLOBAL|||{\"name\":\"a|||b\"}"),
            api("PUT", "/proxies/GLOBAL", "{\"name\":\"a|||b\"}")
        );
        assert_eq!(ControlMessage::parse("get|||proxies|||"), api("GET", "/proxies", ""));
    }

    #[test]
    fn test_colon_form_matches_canonical() {
        assert_eq!(
            ControlMessage::parse("GET:/version:"),
            ControlMessage::parse("GET|||/version|||")
        );
        assert_eq!(
            ControlMessage::parse("PATCH:/configs:{\"mode\":\"rule\"}"),
            api("PATCH", "/configs", "{\"mode\":\"rule\"}")
        );
    }

    #[test]
    fn test_unrecognized() {
        assert_eq!(ControlMessage::parse(""), None);
        assert_eq!(ControlMessage::parse("hello world"), None);
        assert_eq!(ControlMessage::parse("GET:version"), None);
        assert_eq!(ControlMessage::parse("|||/version|||"), None);
        assert_eq!(ControlMessage::parse("GET /version|||x"), None);
    }

    #[test]
    fn test_encode_is_canonical() {
        let msg = ControlMessage::Api(ApiRequest::new("delete", "/connections", ""));
        assert_eq!(msg.encode(), "DELETE|||/connections|||");
        assert_eq!(ControlMessage::parse(&msg.encode()), Some(msg));
        assert_eq!(ControlMessage::SetMode("rule".into()).encode(), "setMode:rule");
    }
}
