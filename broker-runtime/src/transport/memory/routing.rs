//! 内存 broker 的路由匹配
//!
//! 按 AMQP 0-9-1 的语义模拟交换机路由：`topic` 以 `.` 分词，
//! `*` 恰好匹配一个词，`#` 匹配零个或多个词。
//!
use crate::config::ExchangeKind;

pub(crate) fn routes(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
        // headers 交换机按消息头匹配，内存实现不支持
        ExchangeKind::Headers => false,
    }
}

pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => match_words(rest, key_rest),
        (Some((word, rest)), Some((head, key_rest))) if word == head => {
            match_words(rest, key_rest)
        }
        _ => false,
    }
}
