use std::sync::OnceLock;

use regex::Regex;

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            "[\u{001B}\u{009B}][\\[\\]()#;?]*(?:(?:(?:[a-zA-Z\\d]*(?:;[a-zA-Z\\d]*)*)?\u{0007})|(?:(?:\\d{1,4}(?:;\\d{0,4})*)?[\\dA-PRZcf-ntqry=><~]))",
        )
        .expect("ansi strip regex")
    })
}

/// Removes ANSI escape sequences from a console line.
#[must_use]
pub fn strip_ansi(line: &str) -> String {
    ansi_regex().replace_all(line, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::strip_ansi;

    #[test]
    fn strips_color_codes() {
        assert_eq!(strip_ansi("\u{001B}[31mDone\u{001B}[0m (2.1s)"), "Done (2.1s)");
    }

    #[test]
    fn passes_plain_text_through() {
        assert_eq!(strip_ansi("Server started on 0.0.0.0:25565"), "Server started on 0.0.0.0:25565");
    }
}
