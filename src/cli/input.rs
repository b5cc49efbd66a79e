//! Hook event input on stdin.

use std::io::IsTerminal;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fields the hooks read from the event. Each is taken independently, so one
/// field of the wrong type does not discard the others.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookInput {
    pub session_id: Option<String>,
    pub transcript_path: Option<String>,
    pub trigger: Option<String>,
    pub source: Option<String>,
}

impl HookInput {
    pub fn from_value(value: &Value) -> Self {
        let field = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            session_id: field("session_id"),
            transcript_path: field("transcript_path"),
            trigger: field("trigger"),
            source: field("source"),
        }
    }

    /// `None` unless `raw` is a JSON object.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw.trim()).ok()?;
        value.is_object().then(|| Self::from_value(&value))
    }
}

/// Read the event from stdin, giving up after `timeout`. A terminal reads as
/// no event.
pub async fn read_stdin(timeout: Duration) -> Option<HookInput> {
    if std::io::stdin().is_terminal() {
        return None;
    }
    read_input(tokio::io::stdin(), timeout).await
}

/// Read `reader` to the end, giving up after `timeout`. A timeout, a read
/// error or unparsable input all read as no event.
pub async fn read_input<R: AsyncRead + Unpin>(mut reader: R, timeout: Duration) -> Option<HookInput> {
    let mut raw = String::new();
    match tokio::time::timeout(timeout, reader.read_to_string(&mut raw)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "failed to read hook input");
            return None;
        }
        Err(_) => {
            tracing::debug!(?timeout, "timed out waiting for hook input");
            return None;
        }
    }
    let input = HookInput::parse(&raw);
    if input.is_none() && !raw.trim().is_empty() {
        tracing::debug!("hook input is not a JSON object");
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_fields() {
        let input = HookInput::parse(
            r#"{"session_id":"abc","transcript_path":"/t.jsonl","trigger":"manual","hook_event_name":"PreCompact"}"#,
        )
        .unwrap();
        assert_eq!(input.session_id.as_deref(), Some("abc"));
        assert_eq!(input.transcript_path.as_deref(), Some("/t.jsonl"));
        assert_eq!(input.trigger.as_deref(), Some("manual"));
        assert_eq!(input.source, None);
    }

    #[test]
    fn wrong_types_drop_only_that_field() {
        let input = HookInput::parse(r#"{"session_id": 42, "source": "clear"}"#).unwrap();
        assert_eq!(input.session_id, None);
        assert_eq!(input.source.as_deref(), Some("clear"));
    }

    #[tokio::test]
    async fn silent_writer_times_out_as_no_input() {
        let (_writer, reader) = tokio::io::duplex(64);
        let started = std::time::Instant::now();
        let input = read_input(reader, Duration::from_millis(50)).await;
        assert_eq!(input, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn reads_until_writer_closes() {
        use tokio::io::AsyncWriteExt;

        let (mut writer, reader) = tokio::io::duplex(64);
        writer
            .write_all(br#"{"session_id":"abc","source":"compact"}"#)
            .await
            .unwrap();
        drop(writer);
        let input = read_input(reader, Duration::from_secs(5)).await.unwrap();
        assert_eq!(input.session_id.as_deref(), Some("abc"));
        assert_eq!(input.source.as_deref(), Some("compact"));
    }

    #[tokio::test]
    async fn partial_event_before_timeout_is_no_input() {
        use tokio::io::AsyncWriteExt;

        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(br#"{"session_id":"#).await.unwrap();
        assert_eq!(read_input(reader, Duration::from_millis(50)).await, None);
    }

    #[test]
    fn non_objects_are_no_input() {
        assert_eq!(HookInput::parse(""), None);
        assert_eq!(HookInput::parse("not json"), None);
        assert_eq!(HookInput::parse("[1,2]"), None);
    }
}
