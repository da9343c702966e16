use anyhow::{Result, anyhow};

const XDG_FALLBACKS: [(&str, &str); 3] = [
    ("XDG_DATA_HOME", "/.local/share"),
    ("XDG_CONFIG_HOME", "/.config"),
    ("XDG_CACHE_HOME", "/.cache"),
];

/// One `$NAME` or `${NAME}` occurrence, as byte offsets into the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EnvToken {
    start: usize,
    len: usize,
    name_start: usize,
    name_len: usize,
}

impl EnvToken {
    fn bare(start: usize, end: usize) -> Self {
        EnvToken {
            start,
            len: end - start,
            name_start: start + 1,
            name_len: end - (start + 1),
        }
    }

    /// `close` is the offset of the closing brace.
    fn braced(start: usize, close: usize) -> Self {
        EnvToken {
            start,
            len: close + 1 - start,
            name_start: start + 2,
            name_len: close - (start + 2),
        }
    }

    fn name<'a>(&self, input: &'a str) -> &'a str {
        &input[self.name_start..self.name_start + self.name_len]
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn scan_tokens(input: &str) -> Vec<EnvToken> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut bare_start: Option<usize> = None;
    let mut braced_start: Option<usize> = None;
    let mut i = 0;

    while i < bytes.len() {
        if let Some(start) = bare_start {
            if !is_name_byte(bytes[i]) {
                tokens.push(EnvToken::bare(start, i));
                bare_start = None;
                // the terminating byte may itself start the next token
                continue;
            }
        } else if let Some(start) = braced_start {
            if bytes[i] == b'}' {
                tokens.push(EnvToken::braced(start, i));
                braced_start = None;
            }
        } else if bytes[i] == b'$' {
            if i + 1 >= bytes.len() {
                break;
            }
            if bytes[i + 1] == b'{' {
                braced_start = Some(i);
                i += 1;
            } else {
                bare_start = Some(i);
            }
        }
        i += 1;
    }

    if let Some(start) = bare_start {
        tokens.push(EnvToken::bare(start, bytes.len()));
    }

    tokens
}

fn xdg_fallback(
    name: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Option<Result<String>> {
    let (_, suffix) = XDG_FALLBACKS.iter().find(|(var, _)| *var == name)?;
    Some(match lookup("HOME") {
        Some(home) => Ok(format!("{}{}", home, suffix)),
        None => Err(anyhow!("Unable to find $HOME to derive {}", name)),
    })
}

/**
 * Expands `$NAME` and `${NAME}` references, looking names up with `lookup`.
 * `XDG_DATA_HOME`, `XDG_CONFIG_HOME` and `XDG_CACHE_HOME` fall back to their
 * standard locations under `$HOME`. Any other undefined name is an error.
 */
pub fn expand_env_vars_with(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String> {
    let tokens = scan_tokens(input);
    if tokens.is_empty() {
        return Ok(input.to_string());
    }

    let mut output = String::with_capacity(input.len());
    let mut pos = 0;

    for token in tokens {
        let name = token.name(input);
        let value = match lookup(name) {
            Some(value) => value,
            None => match xdg_fallback(name, lookup) {
                Some(value) => value?,
                None => {
                    return Err(anyhow!(
                        "Unable to find variable {} in {}",
                        name,
                        input
                    ));
                }
            },
        };

        output.push_str(&input[pos..token.start]);
        output.push_str(&value);
        pos = token.start + token.len;
    }

    output.push_str(&input[pos..]);
    Ok(output)
}
