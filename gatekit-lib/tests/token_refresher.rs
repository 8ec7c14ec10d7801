//! Integration tests for the token refresher and the JSON API client.

mod common;

use gatekit_lib::api::ApiClient;
use gatekit_lib::test_utils::CountingTokenSource;
use gatekit_lib::{GatewayError, TokenConfig, TokenRefresher};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn http_config(server: &MockServer) -> TokenConfig {
    TokenConfig::new("wx_test_app", "app-secret")
        .with_endpoints(
            format!("{}/cgi-bin/token", server.uri()),
            format!("{}/cgi-bin/ticket/getticket", server.uri()),
        )
        .with_timeout(5)
}

// ============================================================================
// Refresh deduplication
// ============================================================================

#[tokio::test]
async fn test_concurrent_stale_refreshes_fetch_once() {
    common::init_tracing();
    let source = Arc::new(CountingTokenSource::new(7200).with_delay(Duration::from_millis(50)));
    let refresher = Arc::new(TokenRefresher::spawn(source.clone(), false, Duration::from_secs(7200)));

    let stale = refresher.token().await.unwrap();
    assert_eq!(stale, "token-1");
    assert_eq!(source.token_calls(), 1);

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let refresher = Arc::clone(&refresher);
        let stale = stale.clone();
        tasks.spawn(async move { refresher.refresh_token(&stale).await });
    }

    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap(), "token-2");
    }
    assert_eq!(source.token_calls(), 2);
}

#[tokio::test]
async fn test_refresh_after_background_refresh_is_free() {
    common::init_tracing();
    let source = Arc::new(CountingTokenSource::new(7200));
    let refresher = TokenRefresher::spawn(source.clone(), false, Duration::from_secs(7200));

    let mut updates = refresher.subscribe();
    updates.wait_for(|state| !state.token.is_empty()).await.unwrap();

    let mut tasks = JoinSet::new();
    let refresher = Arc::new(refresher);
    for _ in 0..8 {
        let refresher = Arc::clone(&refresher);
        tasks.spawn(async move { refresher.refresh_token("token-0").await });
    }
    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap(), "token-1");
    }
    assert_eq!(source.token_calls(), 1);
}

// ============================================================================
// HTTP token source
// ============================================================================

#[tokio::test]
async fn test_http_token_and_ticket() {
    common::init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .and(query_param("grant_type", "client_credential"))
        .and(query_param("appid", "wx_test_app"))
        .and(query_param("secret", "app-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ACCESS_TOKEN",
            "expires_in": 7200
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cgi-bin/ticket/getticket"))
        .and(query_param("access_token", "ACCESS_TOKEN"))
        .and(query_param("type", "jsapi"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "ticket": "JSAPI_TICKET",
            "expires_in": 7200
        })))
        .expect(1)
        .mount(&server)
        .await;

    let refresher = TokenRefresher::from_config(http_config(&server).with_ticket(true)).unwrap();
    assert_eq!(refresher.token().await.unwrap(), "ACCESS_TOKEN");
    assert_eq!(refresher.ticket().await.unwrap(), "JSAPI_TICKET");
}

#[tokio::test]
async fn test_http_token_error_code() {
    common::init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 40013,
            "errmsg": "invalid appid"
        })))
        .mount(&server)
        .await;

    let refresher = TokenRefresher::from_config(http_config(&server)).unwrap();
    let err = refresher.token().await.unwrap_err();
    assert!(matches!(err, GatewayError::Api { code: 40013, .. }));
}

#[tokio::test]
async fn test_http_token_lifetime_out_of_range() {
    common::init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "SHORT_LIVED",
            "expires_in": 60
        })))
        .mount(&server)
        .await;

    let refresher = TokenRefresher::from_config(http_config(&server)).unwrap();
    let err = refresher.token().await.unwrap_err();
    assert!(matches!(err, GatewayError::TokenLifetime(60)));
    assert!(refresher.snapshot().token.is_empty());
}

// ============================================================================
// JSON API client
// ============================================================================

#[tokio::test]
async fn test_api_client_refreshes_rejected_token_once() {
    common::init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "TOKEN_A",
            "expires_in": 7200
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "TOKEN_B",
            "expires_in": 7200
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cgi-bin/menu/get"))
        .and(query_param("access_token", "TOKEN_A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 42001,
            "errmsg": "access_token expired"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cgi-bin/menu/get"))
        .and(query_param("access_token", "TOKEN_B"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "menu": {"button": []}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = Arc::new(TokenRefresher::from_config(http_config(&server)).unwrap());
    let client = ApiClient::new(server.uri(), tokens, 5).unwrap();

    let menu: serde_json::Value = client.get_json("cgi-bin/menu/get", &[]).await.unwrap();
    assert_eq!(menu["menu"]["button"], json!([]));
}

#[tokio::test]
async fn test_api_client_surfaces_other_error_codes() {
    common::init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/cgi-bin/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "TOKEN_A",
            "expires_in": 7200
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/cgi-bin/menu/create"))
        .and(query_param("access_token", "TOKEN_A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 40018,
            "errmsg": "invalid button name size"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = Arc::new(TokenRefresher::from_config(http_config(&server)).unwrap());
    let client = ApiClient::new(server.uri(), tokens, 5).unwrap();

    let body = json!({"button": [{"type": "click", "name": "", "key": "V1001"}]});
    let err = client
        .post_json::<_, serde_json::Value>("cgi-bin/menu/create", &body)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Api { code: 40018, .. }));
}
