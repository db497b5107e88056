use crate::{
    constants::{MAX_GROUP_NAME_LENGTH, MAX_SEARCH_QUERY_LENGTH},
    domain::{MediaRef, MessageKind},
    error::{ApiError, ApiResult},
};

pub fn validate_text_message(content: &str, max_len: usize) -> ApiResult<()> {
    if content.trim().is_empty() {
        return Err(ApiError::validation("Message content is required"));
    }
    if content.chars().count() > max_len {
        return Err(ApiError::validation(format!(
            "Message must be at most {max_len} characters"
        )));
    }
    Ok(())
}

pub fn validate_outgoing(
    kind: MessageKind,
    content: Option<&str>,
    media: Option<&MediaRef>,
    max_len: usize,
) -> ApiResult<()> {
    match kind {
        MessageKind::Text => validate_text_message(content.unwrap_or_default(), max_len),
        MessageKind::Image => {
            let Some(media) = media else {
                return Err(ApiError::validation("Image message requires media"));
            };
            if media.url.trim().is_empty() {
                return Err(ApiError::validation("Image message requires media"));
            }
            if let Some(caption) = content {
                if caption.chars().count() > max_len {
                    return Err(ApiError::validation(format!(
                        "Caption must be at most {max_len} characters"
                    )));
                }
            }
            Ok(())
        }
    }
}

pub fn validate_group_name(name: &str) -> ApiResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("Group name is required"));
    }
    if trimmed.chars().count() > MAX_GROUP_NAME_LENGTH {
        return Err(ApiError::validation(format!(
            "Group name must be at most {MAX_GROUP_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

pub fn validate_search_query(query: &str) -> ApiResult<()> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("Search query is required"));
    }
    if trimmed.chars().count() > MAX_SEARCH_QUERY_LENGTH {
        return Err(ApiError::validation("Search query too long"));
    }
    Ok(())
}
