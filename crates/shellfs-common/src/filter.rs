//! Message filters over a sequence-ordered list.
//!
//! All matching is against *derived* slugs, case-insensitively, so a tool
//! result whose raw type is `user` never matches `user`.

use std::ops::Range;

use crate::message::MessageList;

impl MessageList {
    /// The final `n` messages: everything when `n >= len`, nothing when
    /// `n == 0`.
    pub fn last_range(&self, n: usize) -> Range<usize> {
        let len = self.len();
        len.saturating_sub(n)..len
    }

    /// The suffix strictly *after* the n-th-from-last message whose derived
    /// slug matches, or `None` when there are fewer than `n` matches.
    pub fn since_range(&self, slug: &str, n: usize) -> Option<Range<usize>> {
        self.nth_match_from_end(slug, n)
            .map(|index| index + 1..self.len())
    }

    /// The index of the n-th-from-last message whose derived slug matches.
    pub fn from_index(&self, slug: &str, n: usize) -> Option<usize> {
        self.nth_match_from_end(slug, n)
    }

    /// The number of messages whose derived slug matches.
    pub fn match_count(&self, slug: &str) -> usize {
        (0..self.len())
            .filter(|&i| self.slug(i).eq_ignore_ascii_case(slug))
            .count()
    }

    fn nth_match_from_end(&self, slug: &str, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let mut remaining = n;
        for index in (0..self.len()).rev() {
            if self.slug(index).eq_ignore_ascii_case(slug) {
                remaining -= 1;
                if remaining == 0 {
                    return Some(index);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use crate::message::{Message, MessageList};

    fn message(seq: u64, message_type: &str, data: Option<&str>) -> Message {
        Message {
            message_id: format!("m{seq}"),
            sequence_id: seq,
            message_type: message_type.to_string(),
            llm_data: data.map(String::from),
            ..Message::default()
        }
    }

    /// user, shelley(tool_use bash), user(tool_result), shelley(text),
    /// user("thanks").
    fn sample() -> MessageList {
        MessageList::from_messages(vec![
            message(1, "user", Some(r#"{"Content":[{"Type":0,"Text":"hi"}]}"#)),
            message(
                2,
                "shelley",
                Some(r#"{"Content":[{"Type":5,"ToolName":"bash","ID":"t1","ToolInput":{"command":"ls"}}]}"#),
            ),
            message(
                3,
                "user",
                Some(r#"{"Content":[{"Type":6,"ToolUseID":"t1","ToolResult":[{"Text":"a b"}]}]}"#),
            ),
            message(4, "shelley", Some(r#"{"Content":[{"Type":0,"Text":"done"}]}"#)),
            message(5, "user", Some(r#"{"Content":[{"Type":0,"Text":"thanks"}]}"#)),
        ])
    }

    #[test]
    fn last_clamps_to_length() {
        let list = sample();
        assert_eq!(list.last_range(2), 3..5);
        assert_eq!(list.last_range(99), 0..5);
        assert_eq!(list.last_range(0), 5..5);
    }

    #[test]
    fn since_returns_suffix_after_marker() {
        let list = sample();
        // The last `user` message is the tail, so the suffix is empty.
        assert_eq!(list.since_range("user", 1), Some(5..5));
        // One before that is the plain "hi" user message? No — the tool
        // result at index 2 derives to bash-result, so the second user
        // match from the end is index 0.
        assert_eq!(list.since_range("user", 2), Some(1..5));
        assert_eq!(list.since_range("bash-result", 1), Some(3..5));
        assert_eq!(list.since_range("user", 3), None);
    }

    #[test]
    fn since_never_includes_the_marker() {
        let list = sample();
        for n in 1..=2 {
            let range = list.since_range("user", n).unwrap();
            for index in range {
                assert_ne!(list.slug(index), "user");
            }
        }
    }

    #[test]
    fn since_matches_derived_slug_not_raw_type() {
        let list = sample();
        // Index 2 has raw type `user` but derives to bash-result; counting
        // `user` matches must skip it.
        assert_eq!(list.since_range("user", 2), Some(1..5));
    }

    #[test]
    fn since_is_case_insensitive() {
        let list = sample();
        assert_eq!(list.since_range("USER", 1), Some(5..5));
        assert_eq!(list.since_range("Bash-Result", 1), Some(3..5));
    }

    #[test]
    fn from_returns_the_marker_itself() {
        let list = sample();
        assert_eq!(list.from_index("user", 1), Some(4));
        assert_eq!(list.from_index("agent", 1), Some(3));
        assert_eq!(list.from_index("bash-tool", 1), Some(1));
        assert_eq!(list.from_index("agent", 9), None);
    }

    #[test]
    fn match_count_counts_derived_slugs() {
        let list = sample();
        assert_eq!(list.match_count("user"), 2);
        assert_eq!(list.match_count("agent"), 1);
        assert_eq!(list.match_count("bash-result"), 1);
        assert_eq!(list.match_count("nope"), 0);
    }

    #[test]
    fn zero_n_is_no_match() {
        let list = sample();
        assert_eq!(list.since_range("user", 0), None);
        assert_eq!(list.from_index("user", 0), None);
    }
}
