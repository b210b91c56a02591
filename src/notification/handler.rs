use axum::http::StatusCode;

impl From<&super::Error> for StatusCode {
    fn from(e: &super::Error) -> Self {
        match e {
            super::Error::NotFound(_) | super::Error::_User(crate::user::Error::NotFound(_)) => {
                Self::NOT_FOUND
            }
            super::Error::Forbidden(_) => Self::FORBIDDEN,
            super::Error::EmptyTitle | super::Error::NotAGroup(_) | super::Error::_Participant(_) => {
                Self::BAD_REQUEST
            }
            super::Error::_Room(e) => Self::from(e),
            super::Error::Malformed(_)
            | super::Error::_User(_)
            | super::Error::_R2d2(_)
            | super::Error::_Diesel(_) => Self::INTERNAL_SERVER_ERROR,
        }
    }
}

pub(super) mod api {
    use axum::{
        Extension, Json,
        extract::{Path, State},
        http::StatusCode,
    };
    use serde::Deserialize;

    use crate::notification::{
        self,
        model::{InboxItem, NewNotification, Notification, Target},
    };
    use crate::participant::Participant;

    pub async fn find_all(
        Extension(participant): Extension<Participant>,
        notification_service: State<notification::Service>,
    ) -> crate::Result<Json<Vec<InboxItem>>> {
        let inbox = notification_service.find_for(&participant).await?;
        Ok(Json(inbox))
    }

    #[derive(Deserialize)]
    pub struct SendParams {
        #[serde(flatten)]
        notification: NewNotification,
        target: Target,
    }

    pub async fn send(
        Extension(participant): Extension<Participant>,
        notification_service: State<notification::Service>,
        Json(params): Json<SendParams>,
    ) -> crate::Result<(StatusCode, Json<Notification>)> {
        let sent = notification_service
            .send(&participant, params.notification, &params.target)
            .await?;
        Ok((StatusCode::CREATED, Json(sent)))
    }

    pub async fn mark_read(
        Extension(participant): Extension<Participant>,
        notification_service: State<notification::Service>,
        Path(id): Path<notification::Id>,
    ) -> crate::Result<StatusCode> {
        notification_service.mark_read(&participant, &id).await?;
        Ok(StatusCode::NO_CONTENT)
    }
}
