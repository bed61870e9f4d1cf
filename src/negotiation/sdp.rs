use crate::error::NegotiationError;

/// Syntactic check of an SDP answer: a `v=0` preamble and at least one media section
pub fn validate_answer(sdp: &str) -> Result<(), NegotiationError> {
    let sdp = sdp.trim_start();
    if sdp.trim().is_empty() {
        return Err(NegotiationError::RemoteAnswerInvalid(
            "empty answer body".to_string(),
        ));
    }

    if !sdp.starts_with("v=0") {
        return Err(NegotiationError::RemoteAnswerInvalid(
            "answer does not start with v=0".to_string(),
        ));
    }

    if !sdp.lines().any(|line| line.starts_with("m=")) {
        return Err(NegotiationError::RemoteAnswerInvalid(
            "answer has no media section".to_string(),
        ));
    }

    Ok(())
}

/// Number of `a=candidate` lines, for logging
pub fn candidate_count(sdp: &str) -> usize {
    sdp.lines()
        .filter(|line| line.starts_with("a=candidate"))
        .count()
}
