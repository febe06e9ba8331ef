pub(crate) const MODE_ALLOWED: i32 = 0;
pub(crate) const MODE_IGNORED: i32 = 1;
pub(crate) const MODE_ERRORED: i32 = 2;
pub(crate) const MODE_DEFAULT: i32 = 3;
pub(crate) const MODE_FOREGROUND: i32 = 4;

/// Op code of an entry known only by name.
pub(crate) const OP_NONE: i32 = -1;

pub(crate) fn mode_name(mode: i32) -> Option<&'static str> {
    match mode {
        MODE_ALLOWED => Some("allow"),
        MODE_IGNORED => Some("ignore"),
        MODE_ERRORED => Some("deny"),
        MODE_DEFAULT => Some("default"),
        MODE_FOREGROUND => Some("foreground"),
        _ => None,
    }
}

fn mode_from_name(name: &str) -> Option<i32> {
    match name {
        "allow" => Some(MODE_ALLOWED),
        "ignore" => Some(MODE_IGNORED),
        "deny" | "errored" => Some(MODE_ERRORED),
        "default" => Some(MODE_DEFAULT),
        "foreground" => Some(MODE_FOREGROUND),
        _ => None,
    }
}

/// `appops get <pkg> <op>` prints `OP_NAME: allow; time=...` or
/// `No operations.` when nothing was ever set.
pub(crate) fn parse_mode(output: &str) -> i32 {
    output
        .split(|c: char| c == ':' || c == ';' || c.is_whitespace())
        .find_map(mode_from_name)
        .unwrap_or(MODE_DEFAULT)
}

/// `appops get <pkg>` lists one `OP_NAME: mode; ...` line per op; uid modes
/// carry a `Uid mode: ` prefix.
pub(crate) fn parse_ops(output: &str) -> Vec<(String, i32)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let line = line
                .strip_prefix("Uid mode:")
                .map(str::trim_start)
                .unwrap_or(line);
            let (name, rest) = line.split_once(':')?;
            let name = name.trim();
            let is_op_name = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
            is_op_name.then(|| (name.to_string(), parse_mode(rest)))
        })
        .collect()
}
