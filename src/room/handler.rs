use axum::http::StatusCode;

impl From<&super::Error> for StatusCode {
    fn from(e: &super::Error) -> Self {
        match e {
            super::Error::NotFound(_) | super::Error::_User(crate::user::Error::NotFound(_)) => {
                Self::NOT_FOUND
            }
            super::Error::NotAMember(_)
            | super::Error::Closed(_)
            | super::Error::NotAGuest
            | super::Error::NotAMemberAccount => Self::FORBIDDEN,
            super::Error::SelfChat
            | super::Error::MissingName
            | super::Error::NotEnoughMembers
            | super::Error::_Message(_)
            | super::Error::_Participant(_) => Self::BAD_REQUEST,
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
        extract::{Path, Query, State},
        http::StatusCode,
    };
    use serde::Deserialize;

    use crate::message::model::{Message, Page};
    use crate::participant::Participant;
    use crate::room::{
        self,
        model::{Room, RoomSummary},
    };
    use crate::{identity, user};

    pub async fn find_all(
        Extension(participant): Extension<Participant>,
        room_service: State<room::Service>,
    ) -> crate::Result<Json<Vec<RoomSummary>>> {
        let rooms = room_service.list_rooms(&participant).await?;
        Ok(Json(rooms))
    }

    #[derive(Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct SupportParams {
        guest_name: Option<String>,
    }

    pub async fn open_support(
        Extension(participant): Extension<Participant>,
        room_service: State<room::Service>,
        params: Option<Json<SupportParams>>,
    ) -> crate::Result<Json<Room>> {
        let params = params.map(|Json(p)| p).unwrap_or_default();

        // a name given with the request wins over the one from the handshake
        let guest = match (participant, params.guest_name) {
            (Participant::Guest { guest_id, .. }, Some(name)) => Participant::Guest {
                guest_id,
                display_name: identity::guest_display_name(Some(&name)),
            },
            (p, _) => p,
        };

        let room = room_service.open_support(&guest).await?;
        Ok(Json(room))
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PrivateParams {
        member_id: user::Id,
    }

    pub async fn open_private(
        Extension(participant): Extension<Participant>,
        room_service: State<room::Service>,
        Json(params): Json<PrivateParams>,
    ) -> crate::Result<Json<Room>> {
        let room = room_service
            .open_private(&participant, &params.member_id)
            .await?;
        Ok(Json(room))
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GroupParams {
        name: String,
        member_ids: Vec<user::Id>,
        #[serde(default)]
        is_public: bool,
    }

    pub async fn create_group(
        Extension(participant): Extension<Participant>,
        room_service: State<room::Service>,
        Json(params): Json<GroupParams>,
    ) -> crate::Result<(StatusCode, Json<Room>)> {
        let room = room_service
            .create_group(
                &participant,
                &params.name,
                params.is_public,
                &params.member_ids,
            )
            .await?;
        Ok((StatusCode::CREATED, Json(room)))
    }

    pub async fn find_messages(
        Extension(participant): Extension<Participant>,
        room_service: State<room::Service>,
        Path(id): Path<room::Id>,
        Query(page): Query<Page>,
    ) -> crate::Result<Json<Vec<Message>>> {
        let messages = room_service
            .list_messages(&id, &participant, &page)
            .await?;
        Ok(Json(messages))
    }

    #[derive(Deserialize)]
    pub struct SendParams {
        content: String,
    }

    pub async fn send_message(
        Extension(participant): Extension<Participant>,
        room_service: State<room::Service>,
        Path(id): Path<room::Id>,
        Json(params): Json<SendParams>,
    ) -> crate::Result<(StatusCode, Json<Message>)> {
        let msg = room_service
            .send_message(&id, &participant, &params.content)
            .await?;
        Ok((StatusCode::CREATED, Json(msg)))
    }

    pub async fn close(
        Extension(participant): Extension<Participant>,
        room_service: State<room::Service>,
        Path(id): Path<room::Id>,
    ) -> crate::Result<StatusCode> {
        room_service.close_room(&id, &participant).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub async fn leave(
        Extension(participant): Extension<Participant>,
        room_service: State<room::Service>,
        Path(id): Path<room::Id>,
    ) -> crate::Result<StatusCode> {
        room_service.leave_room(&id, &participant).await?;
        Ok(StatusCode::NO_CONTENT)
    }
}
