use thiserror::Error;

pub const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSessionId {
    #[error("session id is empty")]
    Empty,
    #[error("session id is {len} chars, max {max}")]
    TooLong { len: usize, max: usize },
    #[error("session id contains disallowed character {ch:?} at index {index}")]
    DisallowedChar { ch: char, index: usize },
}

/// Session ids are interpolated into endpoint paths, so only ASCII
/// alphanumerics and `-` are accepted.
pub fn validate_session_id(id: &str) -> Result<&str, InvalidSessionId> {
    if id.is_empty() {
        return Err(InvalidSessionId::Empty);
    }
    let len = id.chars().count();
    if len > MAX_SESSION_ID_LEN {
        return Err(InvalidSessionId::TooLong {
            len,
            max: MAX_SESSION_ID_LEN,
        });
    }
    if let Some((index, ch)) = id
        .chars()
        .enumerate()
        .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '-'))
    {
        return Err(InvalidSessionId::DisallowedChar { ch, index });
    }
    Ok(id)
}
