//! Job decoding and prompt assembly

use clusterloop_common::{ClusterLoopError, Result};
use clusterloop_proto::{ChatMessage, IncomingJob};

/// Decode and validate a job body
pub fn decode_job(payload: &[u8]) -> Result<IncomingJob> {
    let job: IncomingJob = serde_json::from_slice(payload)
        .map_err(|e| ClusterLoopError::decode(format!("malformed job body: {}", e)))?;

    validate(&job)?;
    Ok(job)
}

fn validate(job: &IncomingJob) -> Result<()> {
    if job.requested_model.trim().is_empty() {
        return Err(ClusterLoopError::decode("job names no model"));
    }

    if job.message_history.is_empty() && job.effective_system_prompt().is_none() {
        return Err(ClusterLoopError::decode(
            "job has neither messages nor a system prompt",
        ));
    }

    // The conversation id becomes a subject token of the result
    let id = &job.conversation_id;
    if id.is_empty() || id.contains(['.', '*', '>', ' ']) {
        return Err(ClusterLoopError::decode(format!(
            "conversation id {:?} is not a valid subject token",
            id
        )));
    }

    Ok(())
}

/// The body must ask for the model its capability header was routed on
pub fn check_header_model(job: &IncomingJob, header_model: &str) -> Result<()> {
    if job.requested_model != header_model {
        return Err(ClusterLoopError::decode(format!(
            "body asks for model {:?} but header names {:?}",
            job.requested_model, header_model
        )));
    }
    Ok(())
}

/// Message list sent to the engine: system prompt first, then history as is
pub fn assemble_messages(job: &IncomingJob) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(job.message_history.len() + 1);

    if let Some(prompt) = job.effective_system_prompt() {
        messages.push(ChatMessage::system(prompt));
    }
    messages.extend(job.message_history.iter().cloned());

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_system_prompt_goes_first() {
        let job = decode_job(&body(json!({
            "conversation_id": "c1",
            "thread_id": 1,
            "model": "m",
            "system_prompt": "S",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .unwrap();

        assert_eq!(
            assemble_messages(&job),
            vec![ChatMessage::system("S"), ChatMessage::user("hi")]
        );
    }

    #[test]
    fn test_history_order_preserved() {
        let job = decode_job(&body(json!({
            "conversation_id": "c1",
            "thread_id": 1,
            "model": "m",
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "two"},
                {"role": "user", "content": "three"}
            ]
        })))
        .unwrap();

        let contents: Vec<_> = assemble_messages(&job)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_system_prompt_alone_is_enough() {
        let job = decode_job(&body(json!({
            "conversation_id": "c1",
            "thread_id": 1,
            "model": "m",
            "system_prompt": "summarise the weather"
        })))
        .unwrap();

        assert_eq!(assemble_messages(&job).len(), 1);
    }

    #[test]
    fn test_nothing_to_infer_from() {
        let err = decode_job(&body(json!({
            "conversation_id": "c1",
            "thread_id": 1,
            "model": "m",
            "system_prompt": "",
            "messages": []
        })))
        .unwrap_err();

        assert!(matches!(err, ClusterLoopError::Decode(_)));
    }

    #[test]
    fn test_empty_model_rejected() {
        let err = decode_job(&body(json!({
            "conversation_id": "c1",
            "thread_id": 1,
            "model": " ",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .unwrap_err();

        assert!(matches!(err, ClusterLoopError::Decode(_)));
    }

    #[test]
    fn test_bad_conversation_id_rejected() {
        let err = decode_job(&body(json!({
            "conversation_id": "a.b",
            "thread_id": 1,
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .unwrap_err();

        assert!(matches!(err, ClusterLoopError::Decode(_)));
    }

    #[test]
    fn test_header_model_must_match_body() {
        let job = decode_job(&body(json!({
            "conversation_id": "c1",
            "thread_id": -1,
            "model": "big-model",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .unwrap();

        assert!(check_header_model(&job, "big-model").is_ok());
        assert!(matches!(
            check_header_model(&job, "small-model"),
            Err(ClusterLoopError::Decode(_))
        ));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        assert!(matches!(
            decode_job(b"not json"),
            Err(ClusterLoopError::Decode(_))
        ));
    }
}
