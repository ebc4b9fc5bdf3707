use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// `Json<T>` whose rejections are reported as 400 validation errors in the
/// common error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(AppError::Validation(rejection_message(&rejection))),
        }
    }
}

fn rejection_message(rejection: &JsonRejection) -> String {
    match rejection {
        JsonRejection::MissingJsonContentType(_) => {
            "Expected a request with Content-Type: application/json".into()
        }
        other => other.body_text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Login {
        email: String,
    }

    fn request(content_type: &str, body: &'static str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", content_type)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn valid_body_is_extracted() {
        let ApiJson(login) = ApiJson::<Login>::from_request(
            request("application/json", r#"{"email":"a@b.io"}"#),
            &(),
        )
        .await
        .unwrap();
        assert_eq!(login.email, "a@b.io");
    }

    #[tokio::test]
    async fn rejections_become_validation_errors() {
        for (content_type, body) in [
            ("application/json", r#"{"email":42}"#),
            ("application/json", "{not json"),
            ("text/plain", r#"{"email":"a@b.io"}"#),
        ] {
            let err = ApiJson::<Login>::from_request(request(content_type, body), &())
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{content_type} {body}");
        }
    }
}
