use crate::error::AppError;
use crate::middleware::guards::User;
use crate::models::Message;
use crate::state::AppState;
use actix_web::{get, web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub before: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct HistoryPage {
    pub conversation_id: Uuid,
    pub messages: Vec<Message>,
    /// Cursor for the next page, absent once the start of the conversation is reached.
    pub next_before: Option<i64>,
}

pub fn page_size(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

/// GET /api/v1/conversations/{id}/messages
/// Newest-first page of a conversation's history for one of its participants.
#[get("/api/v1/conversations/{id}/messages")]
pub async fn get_messages(
    state: web::Data<AppState>,
    conversation_id: web::Path<Uuid>,
    user: User,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = conversation_id.into_inner();
    let user_id = user.0.user_id;
    let limit = page_size(query.limit);

    let conversation = state
        .store
        .get_conversation(conversation_id)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?
        .filter(|c| !c.is_deleted())
        .ok_or(AppError::NotFound)?;
    if !conversation.can_send(user_id) {
        return Err(AppError::Forbidden);
    }

    let page = state
        .store
        .history(conversation_id, query.before, limit)
        .await
        .map_err(|e| AppError::Database(e.to_string()))?;
    let next_before = if page.len() == limit {
        page.last().map(|m| m.sequence_number)
    } else {
        None
    };
    let messages = page
        .into_iter()
        .filter(|m| m.is_visible_to(user_id))
        .collect();

    Ok(HttpResponse::Ok().json(HistoryPage {
        conversation_id,
        messages,
        next_before,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_clamped() {
        assert_eq!(page_size(None), 50);
        assert_eq!(page_size(Some(0)), 1);
        assert_eq!(page_size(Some(20)), 20);
        assert_eq!(page_size(Some(5000)), 100);
    }
}
