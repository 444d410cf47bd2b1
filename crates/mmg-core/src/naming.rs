//! Tool-name prefixing shared by the aggregation handlers and the router.
//!
//! Aggregated tools are exposed as `<sanitized server name>__<original>`.
//! The separator splits on its first occurrence, so original tool names may
//! themselves contain `__`.

/// Separator between the server prefix and the original tool name.
pub const TOOL_SEPARATOR: &str = "__";

/// Replaces every character outside `[A-Za-z0-9_]` with `_`.
///
/// Idempotent: `sanitize(sanitize(s)) == sanitize(s)`.
pub fn sanitize_server_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Builds the namespaced tool name advertised to clients.
pub fn prefixed_tool_name(server_name: &str, tool_name: &str) -> String {
    format!("{}{TOOL_SEPARATOR}{tool_name}", sanitize_server_name(server_name))
}

/// Splits a namespaced tool name on the first `__` into `(prefix, original)`.
pub fn split_prefixed_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(TOOL_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_non_alphanumerics() {
        assert_eq!(sanitize_server_name("File Ops"), "File_Ops");
        assert_eq!(sanitize_server_name("a.b-c/d"), "a_b_c_d");
        assert_eq!(sanitize_server_name("plain_name3"), "plain_name3");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_server_name("söme server! (v2)");
        assert_eq!(sanitize_server_name(&once), once);
    }

    #[test]
    fn prefix_and_split_round_trip() {
        let full = prefixed_tool_name("File Ops", "read_file");
        assert_eq!(full, "File_Ops__read_file");
        assert_eq!(split_prefixed_name(&full), Some(("File_Ops", "read_file")));
    }

    #[test]
    fn split_uses_first_separator_only() {
        assert_eq!(
            split_prefixed_name("srv__tool__with__underscores"),
            Some(("srv", "tool__with__underscores"))
        );
        assert_eq!(split_prefixed_name("no_separator"), None);
    }
}
