//! Path expansion and XDG directory resolution.

use std::path::PathBuf;

/// Expand a leading `~/` and any `$VAR` / `${VAR}` references.
///
/// Unknown variables expand to the empty string, matching shell semantics
/// for unset variables.
pub fn expand_path(path: &str) -> PathBuf {
    let mut expanded = if let Some(rest) = path.strip_prefix("~/") {
        let mut p = home_dir();
        p.push(rest);
        p.to_string_lossy().into_owned()
    } else if path == "~" {
        home_dir().to_string_lossy().into_owned()
    } else {
        path.to_string()
    };
    expanded = expand_env(&expanded);
    PathBuf::from(expanded)
}

/// The user's home directory (`$HOME`, falling back to `/`).
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// slinky's state directory: `$XDG_STATE_HOME/slinky` or
/// `~/.local/state/slinky`.
pub fn state_dir() -> PathBuf {
    let base = std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| home_dir().join(".local").join("state"));
    base.join("slinky")
}

/// Default global config path: `$XDG_CONFIG_HOME/slinky/config.toml` or
/// `~/.config/slinky/config.toml`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| home_dir().join(".config"));
    base.join("slinky").join("config.toml")
}

fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
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
                if closed {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some((_, c)) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}
