//! Custom-args parsing.
//!
//! Operators can append raw engine flags per model. The string is split
//! with shell-style quoting, and any flag the adapter itself owns is
//! rejected so user input cannot silently override the model path or port.

use lmn_domain::{Error, Result};

/// Split a command-line fragment with shell-style quoting: whitespace
/// separates tokens, single and double quotes group, backslash escapes
/// inside double quotes and bare text.
pub fn split(input: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut in_token = false;

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(Error::InvalidRequest(
                                "unterminated single quote in custom args".into(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => {
                                return Err(Error::InvalidRequest(
                                    "dangling escape in custom args".into(),
                                ))
                            }
                        },
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(Error::InvalidRequest(
                                "unterminated double quote in custom args".into(),
                            ))
                        }
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => {
                        return Err(Error::InvalidRequest(
                            "dangling escape in custom args".into(),
                        ))
                    }
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Parse custom args and reject any flag from `reserved`. Matching is on
/// the flag name only, so `--port=9` and `--port 9` both fail.
pub fn parse_custom(input: &str, reserved: &[&str]) -> Result<Vec<String>> {
    let tokens = split(input)?;
    for token in &tokens {
        if !token.starts_with('-') {
            continue;
        }
        let name = token.split('=').next().unwrap_or(token);
        if reserved.contains(&name) {
            return Err(Error::InvalidRequest(format!(
                "custom args may not set {name}: it is managed by the adapter"
            )));
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(
            split("--mlock  --threads 8").unwrap(),
            vec!["--mlock", "--threads", "8"]
        );
    }

    #[test]
    fn quotes_group_tokens() {
        assert_eq!(
            split(r#"--prompt "hello world" --name 'a b'"#).unwrap(),
            vec!["--prompt", "hello world", "--name", "a b"]
        );
    }

    #[test]
    fn escapes_inside_double_quotes() {
        assert_eq!(
            split(r#"--x "say \"hi\"""#).unwrap(),
            vec!["--x", r#"say "hi""#]
        );
    }

    #[test]
    fn unterminated_quote_is_invalid() {
        assert!(split("--x 'oops").is_err());
        assert!(split(r#"--x "oops"#).is_err());
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(split("").unwrap().is_empty());
        assert!(split("   ").unwrap().is_empty());
    }

    #[test]
    fn reserved_flags_are_rejected() {
        let reserved = &["--model", "--port", "-m"];
        assert!(parse_custom("--threads 8", reserved).is_ok());
        assert!(parse_custom("--port 1234", reserved).is_err());
        assert!(parse_custom("--port=1234", reserved).is_err());
        assert!(parse_custom("-m foo.gguf", reserved).is_err());
        // Values that merely look like flags are fine.
        assert!(parse_custom(r#"--prompt "--port""#, reserved).is_ok());
    }
}
