/// Replace `${VAR}` and `${VAR:-fallback}` placeholders in raw config text.
///
/// A placeholder whose variable is unset and has no fallback is kept verbatim,
/// so a missing admin token shows up as an obviously wrong value instead of an
/// empty string.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: emit the remainder literally.
            out.push_str(&rest[start..]);
            return out;
        };
        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(body);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        (name == "BOTLINK_TEST_TOKEN").then(|| "t0k3n".to_string())
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_with("admin_token = \"${BOTLINK_TEST_TOKEN}\"", lookup),
            "admin_token = \"t0k3n\""
        );
    }

    #[test]
    fn uses_fallback_for_unset_var() {
        assert_eq!(substitute_with("port = ${BOTLINK_PORT:-18790}", lookup), "port = 18790");
    }

    #[test]
    fn set_var_wins_over_fallback() {
        assert_eq!(substitute_with("${BOTLINK_TEST_TOKEN:-nope}", lookup), "t0k3n");
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            substitute_with("${BOTLINK_NONEXISTENT_XYZ}", lookup),
            "${BOTLINK_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_with("a ${OPEN", lookup), "a ${OPEN");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}
