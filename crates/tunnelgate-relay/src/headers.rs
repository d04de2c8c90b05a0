//! Header handling for the public HTTP surface and the inspector (spec
//! §4.E, §4.G).
//!
//! Narrowed from the teacher's `relay/src/headers.rs`, which injected
//! `X-Forwarded-*`/CORS headers and applied operator-configured add/set/remove
//! rules. This gateway needs neither — the agent sees the original request
//! headers verbatim and answers with its own — so what survives is the
//! `upsert`-style `Vec<(String, String)>` manipulation the teacher used,
//! narrowed to the two concerns spec actually names: stripping hop-by-hop
//! headers before a message crosses the control channel, and redacting
//! sensitive ones before an exchange is handed back through the inspector.

const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];
const SENSITIVE: &[&str] = &["authorization", "cookie", "set-cookie", "x-api-key"];
const REDACTED: &str = "[REDACTED]";

/// Drop hop-by-hop headers (RFC 7230 §6.1) before forwarding a request or
/// response across the control channel.
pub fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    headers.retain(|(k, _)| !HOP_BY_HOP.iter().any(|h| k.eq_ignore_ascii_case(h)));
}

/// Replace sensitive header values with a redaction marker, for the
/// inspector's `sanitize=true` view. Returns a copy; the stored exchange
/// keeps its raw headers so an operator who trusts the dashboard can still
/// ask for the unsanitized view.
pub fn sanitize(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            if SENSITIVE.iter().any(|s| k.eq_ignore_ascii_case(s)) {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_headers_case_insensitively() {
        let mut h = vec![
            ("Connection".into(), "keep-alive".into()),
            ("X-Request-Id".into(), "abc".into()),
            ("Transfer-Encoding".into(), "chunked".into()),
        ];
        strip_hop_by_hop(&mut h);
        assert_eq!(h, vec![("X-Request-Id".to_string(), "abc".to_string())]);
    }

    #[test]
    fn sanitize_redacts_sensitive_headers_only() {
        let h = vec![
            ("Authorization".to_string(), "Bearer secret".to_string()),
            ("X-Request-Id".to_string(), "abc".to_string()),
            ("Cookie".to_string(), "session=1".to_string()),
        ];
        let s = sanitize(&h);
        assert_eq!(s[0].1, "[REDACTED]");
        assert_eq!(s[1].1, "abc");
        assert_eq!(s[2].1, "[REDACTED]");
    }
}
