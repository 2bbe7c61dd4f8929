/// Whether a sender matches the client's ignore list.
///
/// Entries are matched case-insensitively against the sender's identity and,
/// when known, the full `nick!user@host` mask. Supports exact match and
/// glob-style `*` wildcards. An empty list ignores nobody.
pub fn is_ignored(sender: &str, mask: Option<&str>, ignore: &[String]) -> bool {
    if ignore.is_empty() {
        return false;
    }
    let sender = sender.to_lowercase();
    let mask = mask.map(str::to_lowercase);
    ignore.iter().any(|pattern| {
        let pat = pattern.to_lowercase();
        let matches = |text: &str| {
            if pat.contains('*') {
                glob_match(&pat, text)
            } else {
                pat == text
            }
        };
        matches(&sender) || mask.as_deref().is_some_and(matches)
    })
}

/// Simple glob matching supporting `*` as a wildcard for any sequence of chars.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(idx) => {
                if i == 0 && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            },
            None => return false,
        }
    }
    // Last segment must match at end (unless pattern ends with *)
    if parts.last().is_some_and(|last| !last.is_empty()) {
        text.ends_with(parts[parts.len() - 1])
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn empty_list_ignores_nobody() {
        assert!(!is_ignored("anyone", None, &[]));
    }

    #[rstest]
    #[case("spambot", true)]
    #[case("SpamBot", true)]
    #[case("alice", false)]
    #[case("botany", false)]
    fn suffix_glob(#[case] sender: &str, #[case] ignored: bool) {
        assert_eq!(is_ignored(sender, None, &list(&["*bot"])), ignored);
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let ignore = list(&["Mallory"]);
        assert!(is_ignored("mallory", None, &ignore));
        assert!(!is_ignored("mallory2", None, &ignore));
    }

    #[test]
    fn mask_is_checked_too() {
        let ignore = list(&["*@spam.example.net"]);
        assert!(is_ignored(
            "eve",
            Some("eve!~eve@spam.example.net"),
            &ignore
        ));
        assert!(!is_ignored("eve", Some("eve!~eve@ok.example.net"), &ignore));
        assert!(!is_ignored("eve", None, &ignore));
    }

    #[test]
    fn glob_middle() {
        let ignore = list(&["guest*!*@*"]);
        assert!(is_ignored("guest42", Some("guest42!u@h"), &ignore));
        assert!(!is_ignored("member", Some("member!u@h"), &ignore));
    }
}
