/// Notification title templating: `$identifier` / `${identifier}`
/// interpolation with safe-substitute semantics. Unknown placeholders are
/// left literal, `$$` is a literal dollar, and there are no expressions or
/// conditionals.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed && is_identifier(&name) {
                    match lookup(vars, &name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("${");
                            out.push_str(&name);
                            out.push('}');
                        }
                    }
                } else {
                    // Unterminated or malformed: emit what we consumed.
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
            Some((_, c2)) if c2.is_ascii_alphabetic() || c2 == '_' => {
                let mut name = String::new();
                while let Some((_, c2)) = chars.peek().copied() {
                    if c2.is_ascii_alphanumeric() || c2 == '_' {
                        name.push(c2);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match lookup(vars, &name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }

    out
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn lookup<'a>(vars: &'a [(&str, &str)], name: &str) -> Option<&'a str> {
    vars.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_substitution() {
        let vars = [("channel", "somestreamer"), ("game", "Tetris")];
        assert_eq!(
            render("$channel is playing $game!", &vars),
            "somestreamer is playing Tetris!"
        );
    }

    #[test]
    fn test_braced_substitution() {
        let vars = [("channel", "abc")];
        assert_eq!(render("${channel}live", &vars), "abclive");
    }

    #[test]
    fn test_unknown_placeholder_stays_literal() {
        assert_eq!(render("hello $who", &[]), "hello $who");
        assert_eq!(render("hello ${who}", &[]), "hello ${who}");
    }

    #[test]
    fn test_dollar_escape() {
        let vars = [("amount", "5")];
        assert_eq!(render("$$$amount", &vars), "$5");
    }

    #[test]
    fn test_trailing_and_bare_dollar() {
        assert_eq!(render("price: $ 5$", &[]), "price: $ 5$");
    }

    #[test]
    fn test_malformed_brace() {
        assert_eq!(render("x ${oops", &[]), "x ${oops");
        assert_eq!(render("x ${bad name}", &[]), "x ${bad name}");
    }

    #[test]
    fn test_identifier_boundary() {
        let vars = [("game", "Go")];
        // $games is a different (unknown) identifier, not $game + "s".
        assert_eq!(render("playing $games", &vars), "playing $games");
        assert_eq!(render("playing $game.", &vars), "playing Go.");
    }
}
