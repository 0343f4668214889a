//! Proxy Auto-Config document generation.

pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// Render the PAC document steering the allow-list through the dispatcher.
///
/// Each allow-listed host matches both the exact name and its subdomains;
/// everything else goes DIRECT.
pub fn render(dispatcher_port: u16, hosts: &[String]) -> String {
    let mut clauses = String::new();
    for host in hosts {
        clauses.push_str(&format!(
            "  if (host === \"{host}\" || host.endsWith(\".{host}\")) return \"PROXY 127.0.0.1:{dispatcher_port}\";\n"
        ));
    }
    format!("function FindProxyForURL(url, host) {{\n{clauses}  return \"DIRECT\";\n}}\n")
}

/// PAC document served while the dispatcher is down.
pub fn render_direct_only() -> String {
    "function FindProxyForURL(url, host) {\n  return \"DIRECT\";\n}\n".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::intercept_hosts;

    /// Evaluate the generated PAC the way a PAC runtime would, without a
    /// JS engine: mirror the host tests.
    fn find_proxy(hosts: &[String], port: u16, host: &str) -> String {
        for h in hosts {
            if host == h || host.ends_with(&format!(".{h}")) {
                return format!("PROXY 127.0.0.1:{port}");
            }
        }
        "DIRECT".to_string()
    }

    #[test]
    fn test_allow_list_proxied() {
        let hosts = intercept_hosts();
        assert_eq!(find_proxy(&hosts, 8080, "api.anthropic.com"), "PROXY 127.0.0.1:8080");
        assert_eq!(find_proxy(&hosts, 8080, "claude.ai"), "PROXY 127.0.0.1:8080");
        assert_eq!(find_proxy(&hosts, 8080, "sub.claude.ai"), "PROXY 127.0.0.1:8080");
        assert_eq!(find_proxy(&hosts, 8080, "example.com"), "DIRECT");
        assert_eq!(find_proxy(&hosts, 8080, "notclaude.ai"), "DIRECT");
    }

    #[test]
    fn test_rendered_document_shape() {
        let doc = render(9999, &intercept_hosts());
        assert!(doc.starts_with("function FindProxyForURL(url, host) {"));
        assert!(doc.contains("host === \"api.anthropic.com\""));
        assert!(doc.contains("host.endsWith(\".claude.ai\")"));
        assert!(doc.contains("PROXY 127.0.0.1:9999"));
        assert!(doc.trim_end().ends_with('}'));
    }
}
