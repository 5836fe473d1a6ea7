//! Exchange routing
//!
//! An `Exchange` holds the bindings that connect it to queues. For topic
//! exchanges each binding key is parsed into a `RoutingPattern`:
//!
//! - literal segments match the same word,
//! - `*` matches exactly one word,
//! - `#` matches zero or more words.
//!
//! Duplicate bindings are a no-op. Callers must synchronize access (the
//! broker keeps exchanges behind its state lock).

use std::collections::{BTreeSet, HashSet};

use crate::broker::topology::{ExchangeKind, ExchangeOptions};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    One,
    Many,
}

/// A parsed binding key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutingPattern {
    pub fn parse(pattern: &str) -> Self {
        let mut segments: Vec<Segment> = pattern
            .split('.')
            .map(|word| match word {
                "*" => Segment::One,
                "#" => Segment::Many,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();
        // `#.#` matches exactly what `#` does
        segments.dedup_by(|a, b| *a == Segment::Many && *b == Segment::Many);

        Self {
            raw: pattern.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns `true` when `routing_key` is matched by this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        match_words(&self.segments, &words)
    }
}

/// Runs in `O(segments * words)`: `matched[i]` records whether the segments
/// seen so far can consume exactly the first `i` words.
fn match_words(segments: &[Segment], words: &[&str]) -> bool {
    let mut matched = vec![false; words.len() + 1];
    matched[0] = true;

    for segment in segments {
        let mut next = vec![false; words.len() + 1];
        match segment {
            Segment::Many => {
                let mut reachable = false;
                for (i, slot) in next.iter_mut().enumerate() {
                    reachable |= matched[i];
                    *slot = reachable;
                }
            }
            Segment::One => {
                for i in 1..=words.len() {
                    next[i] = matched[i - 1];
                }
            }
            Segment::Literal(literal) => {
                for i in 1..=words.len() {
                    next[i] = matched[i - 1] && words[i - 1] == literal;
                }
            }
        }
        matched = next;
    }

    matched[words.len()]
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub pattern: RoutingPattern,
}

#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub options: ExchangeOptions,
    pub bindings: HashSet<Binding>,
}

impl Exchange {
    /// Create a new exchange with no bindings.
    pub fn new(name: &str, options: ExchangeOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            bindings: HashSet::new(),
        }
    }

    /// Bind `queue` under `pattern`. Duplicate bindings are ignored.
    pub fn bind(&mut self, queue: &str, pattern: &str) {
        self.bindings.insert(Binding {
            queue: queue.to_string(),
            pattern: RoutingPattern::parse(pattern),
        });
    }

    /// Remove every binding that targets `queue`.
    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|binding| binding.queue != queue);
    }

    /// Names of the queues that should receive a message published under
    /// `routing_key`. A queue matched by several bindings appears once.
    pub fn route(&self, routing_key: &str) -> BTreeSet<&str> {
        self.bindings
            .iter()
            .filter(|binding| match self.options.kind {
                ExchangeKind::Topic => binding.pattern.matches(routing_key),
                ExchangeKind::Direct => binding.pattern.as_str() == routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|binding| binding.queue.as_str())
            .collect()
    }
}
