use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::{debug, error};
use serde::Serialize;

use crate::{hub, identity, integration, notification, room, user};

#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub enum Error {
    _Identity(#[from] identity::Error),
    _Room(#[from] room::Error),
    _Notification(#[from] notification::Error),
    _User(#[from] user::Error),
    _Hub(#[from] hub::Error),
    _Integration(#[from] integration::Error),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::_Identity(e) => e.into(),
            Self::_Room(e) => e.into(),
            Self::_Notification(e) => e.into(),
            Self::_User(user::Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::_User(_) | Self::_Hub(_) | Self::_Integration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show a client; storage details stay in the log.
    pub fn public_message(&self) -> String {
        if self.status().is_server_error() {
            error!("{self}");
            return "Internal server error".to_owned();
        }
        self.to_string()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            message: String,
        }

        let status = self.status();
        if !status.is_server_error() {
            debug!("{status}: {self}");
        }
        let message = self.public_message();

        (status, Json(ErrorResponse { message })).into_response()
    }
}
