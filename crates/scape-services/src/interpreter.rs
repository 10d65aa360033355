//! Command interpreter: text commands to method calls.
//!
//! ```text
//!   [backdoor ]<encrypted text>
//!   text := [seq] word args...        words split on whitespace and commas
//! ```
//!
//! A leading all-digit token is the sequence number. `set`, `get` and
//! `reset` followed by one or two words collapse into a camelCase method
//! name (`set client rate` → `setClientRate`), but only when that name is
//! a declared method; otherwise the tokens are left alone.

use scape_core::ScapeError;

const BACKDOOR: &str = "backdoor";
const PREFIXES: [&str; 3] = ["set", "get", "reset"];

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub method: String,
    pub args: Vec<String>,
    /// −1 when the command carried none.
    pub seq: i64,
    /// Sent in the clear, bypassing decryption and replay checks.
    pub backdoor: bool,
}

/// Parse `raw` into a command.
///
/// `decrypt` is applied unless the command is a backdoor; `method_exists`
/// decides whether a collapsed name is accepted.
pub fn interpret(
    raw: &str,
    decrypt: impl FnOnce(&str) -> Result<String, ScapeError>,
    method_exists: impl Fn(&str) -> bool,
) -> Result<Command, ScapeError> {
    let (text, backdoor) = match strip_backdoor(raw) {
        Some(rest) => {
            tracing::info!(command = rest, "executing backdoor command");
            (rest.to_string(), true)
        }
        None => (decrypt(raw)?, false),
    };

    let mut tokens = tokenize(&text);

    let mut seq = -1;
    if !backdoor {
        if let Some(first) = tokens.first() {
            if first.bytes().all(|b| b.is_ascii_digit()) {
                seq = first
                    .parse::<i64>()
                    .map_err(|_| ScapeError::MalformedCommand(format!("bad sequence number {first}")))?;
                tokens.remove(0);
            }
        }
    }

    collapse(&mut tokens, &method_exists);

    if tokens.is_empty() {
        return Err(ScapeError::MalformedCommand(format!("empty command {raw:?}")));
    }
    let method = tokens.remove(0);
    Ok(Command {
        method,
        args: tokens,
        seq,
        backdoor,
    })
}

pub fn is_backdoor(raw: &str) -> bool {
    strip_backdoor(raw).is_some()
}

/// Text after `backdoor` and one space or comma.
fn strip_backdoor(raw: &str) -> Option<&str> {
    let rest = raw.strip_prefix(BACKDOOR)?;
    rest.strip_prefix(' ').or_else(|| rest.strip_prefix(','))
}

/// Split on whitespace and commas, dropping empty pieces.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn collapse(tokens: &mut Vec<String>, method_exists: &impl Fn(&str) -> bool) {
    if tokens.len() < 2 || !PREFIXES.contains(&tokens[0].as_str()) {
        return;
    }
    let two = camel_case(&tokens[..2]);
    if method_exists(&two) {
        tokens.drain(..2);
        tokens.insert(0, two);
        return;
    }
    if tokens.len() >= 3 {
        let three = camel_case(&tokens[..3]);
        if method_exists(&three) {
            tokens.drain(..3);
            tokens.insert(0, three);
        }
    }
}

/// `["set", "client", "rate"]` → `setClientRate`.
pub fn camel_case(words: &[String]) -> String {
    let mut name = String::new();
    for (i, word) in words.iter().enumerate() {
        if i == 0 {
            name.push_str(word);
            continue;
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            name.extend(first.to_uppercase());
            name.push_str(chars.as_str());
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(text: &str) -> Result<String, ScapeError> {
        Ok(text.to_string())
    }

    fn known(name: &str) -> bool {
        ["setSpeed", "setClientRate", "getRange", "reset"].contains(&name)
    }

    #[test]
    fn sequence_and_collapse() {
        let command = interpret("5 set speed 10,-10", plain, known).unwrap();
        assert_eq!(
            command,
            Command {
                method: "setSpeed".into(),
                args: vec!["10".into(), "-10".into()],
                seq: 5,
                backdoor: false,
            }
        );
    }

    #[test]
    fn three_word_collapse() {
        let command = interpret("set client rate 2 1", plain, known).unwrap();
        assert_eq!(command.method, "setClientRate");
        assert_eq!(command.args, vec!["2", "1"]);
        assert_eq!(command.seq, -1);
    }

    #[test]
    fn unknown_abbreviations_stay_separate() {
        let command = interpret("set volume 3", plain, known).unwrap();
        assert_eq!(command.method, "set");
        assert_eq!(command.args, vec!["volume", "3"]);

        // a lone prefix is never collapsed
        let command = interpret("reset", plain, known).unwrap();
        assert_eq!(command.method, "reset");
    }

    #[test]
    fn decrypts_before_parsing() {
        let shifted = |text: &str| -> Result<String, ScapeError> {
            Ok(text.chars().map(|c| char::from(c as u8 - 1)).collect())
        };
        // "get range" shifted up by one
        let command = interpret("hfu!sbohf", shifted, known).unwrap();
        assert_eq!(command.method, "getRange");
    }

    #[test]
    fn backdoor_skips_decryption_and_sequence() {
        let never = |_: &str| -> Result<String, ScapeError> { panic!("must not decrypt") };
        let command = interpret("backdoor 7 set speed 1 1", never, known).unwrap();
        assert!(command.backdoor);
        assert_eq!(command.seq, -1);
        assert_eq!(command.method, "7");

        let command = interpret("backdoor,set speed 1 1", never, known).unwrap();
        assert_eq!(command.method, "setSpeed");
    }

    #[test]
    fn empty_commands_are_malformed() {
        assert!(matches!(
            interpret("   ", plain, known),
            Err(ScapeError::MalformedCommand(_))
        ));
        assert!(matches!(
            interpret("12", plain, known),
            Err(ScapeError::MalformedCommand(_))
        ));
    }

    #[test]
    fn decrypt_errors_propagate() {
        let failing = |_: &str| -> Result<String, ScapeError> {
            Err(ScapeError::InvalidCipher("speck".into()))
        };
        assert!(matches!(
            interpret("x", failing, known),
            Err(ScapeError::InvalidCipher(_))
        ));
    }

    #[test]
    fn camel_case_joins_words() {
        let words: Vec<String> = ["turn", "wheels"].iter().map(|w| w.to_string()).collect();
        assert_eq!(camel_case(&words), "turnWheels");
    }
}
