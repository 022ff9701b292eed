//! Decoder for the platform's line-delimited chat event stream
//!
//! Each line is one JSON object. The protocol is loose: events come in several
//! shapes, some lines carry nothing we understand, and a line may be corrupt.
//! `decode_line` maps a line to at most one event and never fails; unknown and
//! malformed lines are simply skipped so one bad chunk cannot end a session.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const FINISHED_STEP: &str = "Finished";

/// One recognised event from the chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    /// End of the answer. `text` is the complete final message when the
    /// platform sent one; `None` means "keep what has been accumulated".
    Finished {
        text: Option<String>,
        citations: Option<Value>,
    },
    ConversationId(String),
    Delta(String),
    LanguageDetected(String),
}

/// Decode one raw line. Shapes are tried in a fixed order and the first
/// match wins.
pub fn decode_line(raw: &str) -> Option<DecodedEvent> {
    let line = raw.trim();
    let line = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if line.is_empty() {
        return None;
    }
    if line == "[DONE]" {
        return Some(DecodedEvent::Finished {
            text: None,
            citations: None,
        });
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "skipping malformed stream line");
            return None;
        }
    };
    let event = value.as_object()?;

    if let Some(finished) = final_message(event) {
        return Some(finished);
    }
    if let Some(id) = event.get("conversation_id").and_then(scalar_text) {
        return Some(DecodedEvent::ConversationId(id));
    }
    if let Some(delta) = event.get("content_delta").and_then(content_text) {
        return Some(DecodedEvent::Delta(delta));
    }
    if let Some(content) = event.get("content").and_then(content_text) {
        return Some(DecodedEvent::Delta(content));
    }
    if let Some(language) = ["detected_language", "language"]
        .iter()
        .find_map(|key| event.get(*key).and_then(scalar_text))
    {
        return Some(DecodedEvent::LanguageDetected(language));
    }
    if is_completion_flag(event) {
        return Some(DecodedEvent::Finished {
            text: None,
            citations: None,
        });
    }
    None
}

/// `{"step": "Finished", "content": {"chatbot_message": ...}}`, or a
/// `Finished` step whose `content` is the final message itself.
fn final_message(event: &Map<String, Value>) -> Option<DecodedEvent> {
    if event.get("step").and_then(Value::as_str) != Some(FINISHED_STEP) {
        return None;
    }
    let content = event.get("content")?;
    let Some(message) = content.get("chatbot_message") else {
        return content_text(content).map(|text| DecodedEvent::Finished {
            text: Some(text),
            citations: event.get("citations").filter(|c| !c.is_null()).cloned(),
        });
    };

    let text = match message {
        Value::Object(fields) => fields
            .get("content")
            .map(|c| content_text(c).unwrap_or_default())
            .unwrap_or_else(|| message.to_string()),
        other => content_text(other).unwrap_or_default(),
    };
    let citations = message
        .get("citations")
        .or_else(|| content.get("citations"))
        .or_else(|| event.get("citations"))
        .filter(|c| !c.is_null())
        .cloned();

    Some(DecodedEvent::Finished {
        text: Some(text),
        citations,
    })
}

fn is_completion_flag(event: &Map<String, Value>) -> bool {
    ["done", "finished", "is_finished"]
        .iter()
        .any(|key| event.get(*key).and_then(Value::as_bool) == Some(true))
        || event.get("step").and_then(Value::as_str) == Some(FINISHED_STEP)
}

/// Text of a content field: strings as-is, structured values serialized.
fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Running state of one chat answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamAccumulator {
    pub full_text: String,
    pub conversation_id: Option<String>,
    pub citations: Option<Value>,
    pub detected_language: Option<String>,
    pub finished: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Once finished, further events are ignored.
    pub fn accumulate(&mut self, event: DecodedEvent) {
        if self.finished {
            return;
        }
        match event {
            DecodedEvent::Finished { text, citations } => {
                if let Some(text) = text {
                    self.full_text = text;
                }
                if citations.is_some() {
                    self.citations = citations;
                }
                self.finished = true;
            }
            DecodedEvent::ConversationId(id) => {
                self.conversation_id.get_or_insert(id);
            }
            DecodedEvent::Delta(text) => self.full_text.push_str(&text),
            DecodedEvent::LanguageDetected(language) => {
                self.detected_language.get_or_insert(language);
            }
        }
    }

    /// Decode `line` and apply the result, returning the event if there was one.
    pub fn feed_line(&mut self, line: &str) -> Option<DecodedEvent> {
        let event = decode_line(line)?;
        self.accumulate(event.clone());
        Some(event)
    }
}

/// Splits a byte stream into lines and decodes each one.
struct LineDecoder {
    inner: BoxStream<'static, std::result::Result<Bytes, String>>,
    buffer: Vec<u8>,
    pending: VecDeque<DecodedEvent>,
    ended: bool,
}

impl LineDecoder {
    fn drain_lines(&mut self, at_end: bool) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.push_line(&line);
        }
        if at_end && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.push_line(&line);
        }
    }

    fn push_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        if line.trim().is_empty() {
            return;
        }
        match decode_line(&line) {
            Some(event) => {
                record_line("decoded");
                self.pending.push_back(event);
            }
            None => record_line("ignored"),
        }
    }
}

/// Decode a live response body into events.
///
/// Lines split across chunks are reassembled and a final line without a
/// trailing newline is still decoded. A transport error is yielded once as
/// `Error::Network` and ends the stream.
pub fn decode_stream<S, E>(bytes: S) -> BoxStream<'static, Result<DecodedEvent>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: fmt::Display,
{
    let decoder = LineDecoder {
        inner: bytes.map(|chunk| chunk.map_err(|e| e.to_string())).boxed(),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        ended: false,
    };

    stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(event) = decoder.pending.pop_front() {
                return Some((Ok(event), decoder));
            }
            if decoder.ended {
                return None;
            }
            match decoder.inner.next().await {
                Some(Ok(chunk)) => {
                    decoder.buffer.extend_from_slice(&chunk);
                    decoder.drain_lines(false);
                }
                Some(Err(e)) => {
                    record_line("transport_error");
                    warn!(error = %e, "chat stream interrupted");
                    decoder.ended = true;
                    decoder.buffer.clear();
                    return Some((
                        Err(Error::Network(format!("chat stream interrupted: {e}"))),
                        decoder,
                    ));
                }
                None => {
                    decoder.ended = true;
                    decoder.drain_lines(true);
                }
            }
        }
    })
    .boxed()
}

fn record_line(outcome: &'static str) {
    metrics::counter!("gateway_stream_lines_total", "outcome" => outcome).increment(1);
}
