//! Interactive ABI selection over stdin
//!
//! Publishes an `abi_choice` event and reads one line: a 1-based index or
//! an ABI name. An empty line takes the pre-selected ABI. End of input
//! dismisses the prompt.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use adbg_daemon::AbiPrompt;

use super::{EventSink, HeadlessEvent};

#[derive(Debug, Clone, Default)]
pub struct StdinAbiPrompt {
    sink: EventSink,
}

impl StdinAbiPrompt {
    pub fn new(sink: EventSink) -> Self {
        Self { sink }
    }
}

impl AbiPrompt for StdinAbiPrompt {
    async fn pick(&self, choices: &[String], last: Option<&str>) -> Option<String> {
        self.sink.emit(HeadlessEvent::abi_choice(choices, last));

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        match lines.next_line().await {
            Ok(Some(line)) => parse_choice(&line, choices, last),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read ABI choice: {}", e);
                None
            }
        }
    }
}

/// Interpret one line of user input against `choices`.
pub fn parse_choice(input: &str, choices: &[String], last: Option<&str>) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return last
            .filter(|l| choices.iter().any(|c| c == l))
            .map(str::to_string);
    }

    if let Ok(index) = input.parse::<usize>() {
        return index
            .checked_sub(1)
            .and_then(|i| choices.get(i))
            .cloned();
    }

    let picked = choices.iter().find(|c| c.as_str() == input).cloned();
    if picked.is_none() {
        warn!("'{}' is not one of {:?}", input, choices);
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choices() -> Vec<String> {
        vec!["arm64-v8a".to_string(), "x86_64".to_string()]
    }

    #[test]
    fn test_parse_index_and_name() {
        assert_eq!(parse_choice("2", &choices(), None).as_deref(), Some("x86_64"));
        assert_eq!(parse_choice(" arm64-v8a ", &choices(), None).as_deref(), Some("arm64-v8a"));
        assert_eq!(parse_choice("0", &choices(), None), None);
        assert_eq!(parse_choice("3", &choices(), None), None);
        assert_eq!(parse_choice("mips", &choices(), None), None);
    }

    #[test]
    fn test_empty_line_takes_preselected() {
        assert_eq!(
            parse_choice("", &choices(), Some("x86_64")).as_deref(),
            Some("x86_64")
        );
        assert_eq!(parse_choice("", &choices(), Some("x86")), None);
        assert_eq!(parse_choice("", &choices(), None), None);
    }
}
