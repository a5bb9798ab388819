/// Branch state summarization.
///
/// Converts a linearized history into a structured `StateRecord` by asking
/// the model for JSON in four categories plus a topic line. The summarizer
/// is deterministic in its input order: the same message sequence produces
/// the same prompt, byte for byte; any remaining nondeterminism belongs to
/// the model, not this module.
///
/// Robustness: unparseable model output earns one retry with a stricter
/// prompt. A second failure degrades instead of erroring - the caller gets
/// an empty record flagged `summarization_failed`, and the merge pipeline
/// downgrades conflict detection to structural-only mode. Provider errors
/// (`ModelError`, `ModelTimeout`, `ModelUnavailable`) propagate unchanged.
use crate::error::{ForkyError, ForkyResult};
use crate::model::{messages_from_history, ChatMessage, ModelClient};
use crate::types::{Node, StateRecord};
use tracing::{debug, warn};

const SUMMARY_INSTRUCTIONS: &str = "You distill conversations into structured state. \
Read the transcript and respond with a single JSON object with exactly these keys: \
\"facts\" (list of strings), \"decisions\" (list of strings), \
\"open_questions\" (list of strings), \"assumptions\" (list of strings), \
\"topic\" (one short string). List items in order of appearance. \
Respond with JSON only.";

const STRICT_RETRY_INSTRUCTIONS: &str = "Your previous reply was not parseable JSON. \
Respond with ONLY a JSON object - no prose, no code fences - with exactly the keys \
\"facts\", \"decisions\", \"open_questions\", \"assumptions\" (lists of strings) and \
\"topic\" (string).";

/// Summarize a linearized history into a `StateRecord`.
///
/// `history` is the output of graph linearization: root-first, fork
/// markers already filtered.
pub async fn summarize(
    history: &[Node],
    model: &str,
    client: &dyn ModelClient,
) -> ForkyResult<StateRecord> {
    match try_summarize(history, model, client).await {
        Ok(record) => Ok(record),
        Err(ForkyError::SummarizationFailed(reason)) => {
            warn!(%reason, "summarization exhausted retries, degrading to empty state");
            Ok(StateRecord::failed())
        }
        Err(other) => Err(other),
    }
}

/// The strict variant: `SummarizationFailed` instead of a flagged record.
async fn try_summarize(
    history: &[Node],
    model: &str,
    client: &dyn ModelClient,
) -> ForkyResult<StateRecord> {
    let transcript = render_transcript(history);

    let first_pass = vec![
        ChatMessage::System {
            content: SUMMARY_INSTRUCTIONS.to_string(),
        },
        ChatMessage::User {
            content: transcript.clone(),
        },
    ];
    let response = client.complete(&first_pass, model).await?;
    match parse_state_record(&response) {
        Ok(record) => return Ok(record),
        Err(reason) => {
            debug!(%reason, "summary parse failed, retrying with strict prompt");
        }
    }

    let second_pass = vec![
        ChatMessage::System {
            content: STRICT_RETRY_INSTRUCTIONS.to_string(),
        },
        ChatMessage::User { content: transcript },
    ];
    let response = client.complete(&second_pass, model).await?;
    parse_state_record(&response).map_err(ForkyError::SummarizationFailed)
}

/// Render the history as a plain transcript for the summarization prompt.
fn render_transcript(history: &[Node]) -> String {
    let mut transcript = String::from("Transcript:\n");
    for message in messages_from_history(history) {
        let label = match &message {
            ChatMessage::System { .. } => "system",
            ChatMessage::User { .. } => "user",
            ChatMessage::Assistant { .. } => "assistant",
            ChatMessage::Merge { .. } => "assistant (merge)",
        };
        transcript.push_str(label);
        transcript.push_str(": ");
        transcript.push_str(message.content());
        transcript.push('\n');
    }
    transcript
}

/// Pull the first JSON object out of a model reply and parse it.
///
/// Models like wrapping JSON in prose or code fences; everything outside
/// the outermost braces is ignored.
fn parse_state_record(response: &str) -> Result<StateRecord, String> {
    let start = response
        .find('{')
        .ok_or_else(|| "no JSON object in response".to_string())?;
    let end = response
        .rfind('}')
        .ok_or_else(|| "unterminated JSON object in response".to_string())?;
    if end < start {
        return Err("unterminated JSON object in response".to_string());
    }
    serde_json::from_str(&response[start..=end]).map_err(|e| e.to_string())
}
