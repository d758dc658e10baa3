use reqwest::Client;
use serde_json::Value;
use tokio::net::TcpListener;

use scanwise::{app, build_state_from_env};

// Single test in this binary: environment mutation needs no locking here.
#[tokio::test]
async fn state_built_from_env_reflects_configuration() {
    std::env::set_var("SCANWISE_RATE_LIMIT", "25");
    std::env::set_var("SCANWISE_RATE_WINDOW_SECS", "30");
    std::env::set_var(
        "SCANWISE_REASONER_URL",
        "http://127.0.0.1:1/v1/chat/completions",
    );

    let state = build_state_from_env().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let resp = Client::new()
        .get(format!("http://{}/healthz", addr))
        .send()
        .await
        .unwrap();
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["rateLimit"], 25);
    assert_eq!(json["reasoner"], "http");
    assert_eq!(json["store"], "memory");

    std::env::remove_var("SCANWISE_RATE_LIMIT");
    std::env::remove_var("SCANWISE_RATE_WINDOW_SECS");
    std::env::remove_var("SCANWISE_REASONER_URL");
}
