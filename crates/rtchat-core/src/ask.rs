// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The question/answer overlay.
//!
//! A question travels on the `question` channel as `{n, question: {topic,
//! content}}`; the answer returns on the `answer` channel as `{n, answer,
//! question}`. `n` is allocated monotonically per session and correlates the
//! two; the correlation table lives with the session and dies with it.
//!
//! Ping is a sibling mini-protocol on its own channel: a `ping` frame is
//! answered with a `pong` carrying the original timestamp, which yields the
//! round-trip latency without any clock agreement.

use std::{collections::HashMap, sync::Arc};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Application channel labels with built-in semantics.
pub const CHAT_CHANNEL: &str = "chat";
pub const DM_CHANNEL: &str = "dm";
pub const QUESTION_CHANNEL: &str = "question";
pub const ANSWER_CHANNEL: &str = "answer";
pub const PING_CHANNEL: &str = "ping";

/// Question topics the trust engine answers itself.
pub const IDENTIFY_TOPIC: &str = "identify";
pub const CHALLENGE_TOPIC: &str = "challenge";

/// Sentinel sent on the default channel when the load barrier resolves on
/// the offering side. Intercepted by the receiver, never surfaced as chat.
pub const CONNECTED_SENTINEL: &str = "connectedViaRTC";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionBody {
    pub topic: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionFrame {
    pub n: u64,
    pub question: QuestionBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerFrame {
    pub n: u64,
    pub answer: serde_json::Value,
    pub question: QuestionBody,
}

/// Payload of an `identify` answer: the peer's public key and its signature
/// over the challenge we sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyAnswer {
    pub public_key_string: String,
    pub signature: String,
}

/// Ping/pong frame on the `ping` channel. The pong echoes the ping's
/// timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PingFrame {
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

// ── Handler registry ──────────────────────────────────────────────────────────

/// An application question handler: `(content, sender) → future answer`.
pub type QuestionHandler =
    Arc<dyn Fn(serde_json::Value, String) -> BoxFuture<'static, serde_json::Value> + Send + Sync>;

/// Registered question handlers by topic.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, QuestionHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`, replacing any previous one.
    pub fn register(&mut self, topic: impl Into<String>, handler: QuestionHandler) {
        self.handlers.insert(topic.into(), handler);
    }

    pub fn get(&self, topic: &str) -> Option<QuestionHandler> {
        self.handlers.get(topic).cloned()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn question_frame_wire_form() {
        let frame = QuestionFrame {
            n: 3,
            question: QuestionBody {
                topic: "sum".into(),
                content: json!({"a": 2, "b": 3}),
            },
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: QuestionFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn answer_frame_carries_original_question() {
        let frame = AnswerFrame {
            n: 3,
            answer: json!(5),
            question: QuestionBody {
                topic: "sum".into(),
                content: json!({"a": 2, "b": 3}),
            },
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: AnswerFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back.question.topic, "sum");
        assert_eq!(back.answer, json!(5));
    }

    #[test]
    fn identify_answer_uses_camel_case() {
        let ans = IdentifyAnswer {
            public_key_string: "jwk".into(),
            signature: "sig".into(),
        };
        let text = serde_json::to_string(&ans).unwrap();
        assert!(text.contains("publicKeyString"));
    }

    #[test]
    fn ping_frames_are_tagged() {
        let ping = PingFrame::Ping { timestamp: 7 };
        let text = serde_json::to_string(&ping).unwrap();
        assert!(text.contains("\"kind\":\"ping\""));
        let back: PingFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ping);
    }

    #[tokio::test]
    async fn registry_dispatches_to_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register(
            "sum",
            Arc::new(|content, _sender| {
                Box::pin(async move {
                    let a = content["a"].as_i64().unwrap_or(0);
                    let b = content["b"].as_i64().unwrap_or(0);
                    json!(a + b)
                })
            }),
        );
        let handler = reg.get("sum").unwrap();
        let answer = handler(json!({"a": 2, "b": 3}), "bob".into()).await;
        assert_eq!(answer, json!(5));
        assert!(reg.get("unknown").is_none());
    }
}
