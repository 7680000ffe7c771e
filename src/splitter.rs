/// What a raw command line asks the engine to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// Nothing but whitespace: no output, nothing spawned.
    Empty,
    /// The `cd` builtin with its (trimmed, possibly empty) target.
    ChangeDir(String),
    /// One or more `|`-separated segments, each trimmed and non-empty.
    Pipeline(Vec<String>),
}

/// Keyword that introduces a watch session in the front-end.
pub const WATCH_KEYWORD: &str = "multiWatch";

/// Classify a command line. The `cd` check runs on the trimmed line before
/// any pipe splitting, so `cd a | b` is a `cd` to `"a | b"`.
pub fn parse_line(input: &str) -> Parsed {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Parsed::Empty;
    }

    if let Some(target) = cd_target(trimmed) {
        return Parsed::ChangeDir(target.to_string());
    }

    let segments = split_segments(trimmed);
    if segments.is_empty() {
        // Only pipes and whitespace, e.g. `|  |`.
        return Parsed::Empty;
    }
    Parsed::Pipeline(segments)
}

/// Split on `|`, trimming each segment and dropping empty ones.
pub fn split_segments(input: &str) -> Vec<String> {
    input
        .split('|')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

fn cd_target(trimmed: &str) -> Option<&str> {
    let rest = trimmed.strip_prefix("cd")?;
    if rest.is_empty() {
        return Some("");
    }
    if rest.starts_with([' ', '\t']) {
        return Some(rest.trim());
    }
    None
}

/// States for the watch-argument tokenizer.
enum State {
    /// Between commands: whitespace and commas are skipped
    Normal,
    /// Building an unquoted command: whitespace or a comma ends it
    InWord,
    /// Inside double quotes: everything but `"` and `\` escapes is literal
    InDoubleQuote,
    /// Inside single quotes: everything is literal
    InSingleQuote,
}

/// Recognise `multiWatch ["cmd a", "cmd b"]` (or `multiWatch "cmd a" "cmd b"`).
///
/// Returns `None` when the line is not a watch request, and `Some` with the
/// command list otherwise. The list is empty when no commands were given.
pub fn parse_watch(input: &str) -> Option<Vec<String>> {
    let trimmed = input.trim();
    let rest = trimmed.strip_prefix(WATCH_KEYWORD)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let mut body = rest.trim();
    if let Some(inner) = body.strip_prefix('[') {
        body = inner.strip_suffix(']').unwrap_or(inner);
    }

    Some(
        tokenize_watch_args(body)
            .into_iter()
            .map(|cmd| cmd.trim().to_string())
            .filter(|cmd| !cmd.is_empty())
            .collect(),
    )
}

fn tokenize_watch_args(input: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match (&state, ch) {
            (State::Normal, c) if c.is_whitespace() || c == ',' => {}
            (State::Normal, '"') => state = State::InDoubleQuote,
            (State::Normal, '\'') => state = State::InSingleQuote,
            (State::Normal, c) => {
                current.push(c);
                state = State::InWord;
            }

            (State::InWord, c) if c.is_whitespace() || c == ',' => {
                commands.push(std::mem::take(&mut current));
                state = State::Normal;
            }
            (State::InWord, c) => current.push(c),

            (State::InDoubleQuote, '"') => {
                commands.push(std::mem::take(&mut current));
                state = State::Normal;
            }
            (State::InDoubleQuote, '\\') => match chars.peek() {
                Some(&'"' | &'\\') => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                }
                _ => current.push('\\'),
            },
            (State::InDoubleQuote, c) => current.push(c),

            (State::InSingleQuote, '\'') => {
                commands.push(std::mem::take(&mut current));
                state = State::Normal;
            }
            (State::InSingleQuote, c) => current.push(c),
        }
    }

    // Unterminated quotes keep what was collected.
    if !current.is_empty() {
        commands.push(current);
    }

    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(input: &str) -> Vec<String> {
        match parse_line(input) {
            Parsed::Pipeline(segments) => segments,
            other => panic!("expected pipeline, got {other:?}"),
        }
    }

    #[test]
    fn empty_and_whitespace_lines() {
        assert_eq!(parse_line(""), Parsed::Empty);
        assert_eq!(parse_line("   \t "), Parsed::Empty);
        assert_eq!(parse_line(" | | "), Parsed::Empty);
    }

    #[test]
    fn segments_are_trimmed() {
        assert_eq!(pipeline("  echo hi |tr h H  "), vec!["echo hi", "tr h H"]);
    }

    #[test]
    fn empty_segments_are_dropped() {
        assert_eq!(pipeline("ls || wc -l |"), vec!["ls", "wc -l"]);
    }

    #[test]
    fn single_command_is_one_segment() {
        assert_eq!(pipeline("ls -la"), vec!["ls -la"]);
    }

    #[test]
    fn cd_forms() {
        assert_eq!(parse_line("cd"), Parsed::ChangeDir(String::new()));
        assert_eq!(parse_line("  cd   /tmp  "), Parsed::ChangeDir("/tmp".into()));
        assert_eq!(parse_line("cd ~"), Parsed::ChangeDir("~".into()));
        assert_eq!(parse_line("cd\tsrc"), Parsed::ChangeDir("src".into()));
    }

    #[test]
    fn cd_prefix_of_other_command_is_not_builtin() {
        assert_eq!(pipeline("cdrecord --help"), vec!["cdrecord --help"]);
    }

    #[test]
    fn cd_swallows_pipes() {
        assert_eq!(parse_line("cd a | b"), Parsed::ChangeDir("a | b".into()));
    }

    #[test]
    fn watch_bracket_list() {
        let cmds = parse_watch(r#"multiWatch ["echo a", "date | cut -c1-3"]"#).unwrap();
        assert_eq!(cmds, vec!["echo a", "date | cut -c1-3"]);
    }

    #[test]
    fn watch_bare_quoted_args() {
        let cmds = parse_watch(r#"multiWatch "echo a" 'echo b' uptime"#).unwrap();
        assert_eq!(cmds, vec!["echo a", "echo b", "uptime"]);
    }

    #[test]
    fn watch_escaped_quote() {
        let cmds = parse_watch(r#"multiWatch ["echo \"hi\""]"#).unwrap();
        assert_eq!(cmds, vec![r#"echo "hi""#]);
    }

    #[test]
    fn watch_without_commands_is_empty() {
        assert_eq!(parse_watch("multiWatch"), Some(vec![]));
        assert_eq!(parse_watch("multiWatch [ ]"), Some(vec![]));
    }

    #[test]
    fn non_watch_lines() {
        assert_eq!(parse_watch("echo multiWatch"), None);
        assert_eq!(parse_watch("multiWatcher x"), None);
    }
}
