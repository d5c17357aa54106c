//! Reply predicates for line-oriented devices

use devcom::{Command, DataFormat};

/// A line answers a command when both start with the same first word.
///
/// `READ TEMP` is answered by `READ 21.5`, `PING` by `PING OK`. Lines with
/// no words never match.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixFormat;

fn first_word(s: &str) -> Option<&str> {
    s.split_whitespace().next()
}

impl DataFormat<String> for PrefixFormat {
    fn is_reply(&self, command: &Command<String>, msg: &String) -> bool {
        match (first_word(command.payload()), first_word(msg)) {
            (Some(sent), Some(received)) => sent.eq_ignore_ascii_case(received),
            _ => false,
        }
    }
}
