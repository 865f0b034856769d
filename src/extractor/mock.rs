use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Extractor;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Json(Value),
    Fail(String),
}

/// A scripted extractor for tests. Returns pre-defined replies in order.
pub struct MockExtractor {
    replies: Vec<MockReply>,
    index: AtomicUsize,
}

impl MockExtractor {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            index: AtomicUsize::new(0),
        }
    }

    /// Always succeeds with the same value.
    pub fn returning(value: Value) -> Self {
        Self::new(vec![MockReply::Json(value)])
    }

    /// Always fails with the same message.
    pub fn failing(message: &str) -> Self {
        Self::new(vec![MockReply::Fail(message.to_string())])
    }

    /// Number of times `extract` has been called.
    pub fn calls(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn extract(&self, _image: &[u8]) -> Result<Value> {
        let i = self.index.fetch_add(1, Ordering::SeqCst);
        // A single-reply script repeats forever.
        let reply = if self.replies.len() == 1 {
            self.replies.first()
        } else {
            self.replies.get(i)
        };
        match reply {
            Some(MockReply::Json(value)) => Ok(value.clone()),
            Some(MockReply::Fail(message)) => Err(anyhow::anyhow!("{}", message)),
            None => Err(anyhow::anyhow!(
                "MockExtractor: no more replies (called {} times)",
                i + 1
            )),
        }
    }
}
