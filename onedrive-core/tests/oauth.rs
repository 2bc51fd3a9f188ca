use onedrive_core::{OAuthClient, OAuthError};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn refresh_token_posts_form_data() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .and(body_string_contains("client_id=client-id"))
        .and(body_string_contains("client_secret=secret"))
        .and(body_string_contains(
            "redirect_uri=http%3A%2F%2Flocalhost%2Fcallback",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-2",
            "scope": "Files.ReadWrite"
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "client-id")
        .unwrap()
        .with_client_secret("secret")
        .with_redirect_uri("http://localhost/callback");
    let token = client.refresh_token("refresh-1", None).await.unwrap();

    assert_eq!(token.access_token, "token");
    assert_eq!(token.token_type, "bearer");
    assert_eq!(token.expires_in, Some(3600));
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-2"));
}

#[tokio::test]
async fn refresh_token_surfaces_endpoint_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "client-id").unwrap();
    let err = client
        .refresh_token("stale", Some("Files.ReadWrite"))
        .await
        .expect_err("refresh should fail");

    assert!(matches!(err, OAuthError::Api { status, ref body } if status.as_u16() == 400 && body == "invalid_grant"));
}
