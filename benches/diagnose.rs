use axum::{routing::post, Json, Router};
use criterion::{criterion_group, criterion_main, Criterion};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

use scanwise::{app, build_state, AppConfig};

fn bench_scenarios(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    // Stub reasoner answering instantly with a single conforming finding.
    let reasoner_url = rt.block_on(async {
        async fn completions(Json(_body): Json<Value>) -> Json<Value> {
            let content = json!({
                "diagnostics": [{
                    "code": "P0171",
                    "description": "Mistura pobre detectada",
                    "priority": "attention",
                    "severity": 4,
                    "canDiy": true,
                    "diyDifficulty": 2,
                    "probableCauses": ["vacuum leak"],
                    "solutionUrl": null,
                }]
            })
            .to_string();
            Json(json!({"choices": [{"message": {"role": "assistant", "content": content}}]}))
        }
        let app = Router::new().route("/v1/chat/completions", post(completions));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1/chat/completions", addr)
    });

    let spawn = |config: AppConfig| {
        rt.block_on(async {
            let state = build_state(config);
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = app(state);
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("http://{}/api/diagnose", addr)
        })
    };

    // Limit high enough that throttling never interferes with the bench.
    let reasoner_app = spawn(AppConfig {
        rate_limit: 1_000_000,
        reasoner_url: Some(reasoner_url),
        ..AppConfig::default()
    });
    let fallback_app = spawn(AppConfig {
        rate_limit: 1_000_000,
        ..AppConfig::default()
    });

    let client = Client::new();
    let body = json!({
        "dtcCodes": ["P0171"],
        "vehicleBrand": "Toyota",
        "vehicleModel": "Corolla",
        "vehicleYear": 2015
    });

    let mut run = |name: &str, url: &str| {
        c.bench_function(name, |b| {
            b.iter(|| {
                rt.block_on(async {
                    let resp = client
                        .post(url)
                        .header("x-forwarded-for", "203.0.113.10")
                        .json(&body)
                        .send()
                        .await
                        .unwrap();
                    assert!(resp.status().is_success());
                    let _json: Value = resp.json().await.unwrap();
                })
            })
        });
    };

    run("diagnose_with_reasoner", &reasoner_app);
    run("diagnose_fallback", &fallback_app);
}

criterion_group!(benches, bench_scenarios);
criterion_main!(benches);
