//! Built-in tools against a mock search endpoint

use agentic_pipeline::agent::tools::builtin::search_web_tool;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_search_web_queries_endpoint() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "rust async"))
        .and(query_param("format", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"title": "a"}, {"title": "b"}, {"title": "c"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tool = search_web_tool(Some(format!("{}/search", server.uri())));
    let body = tool
        .invoke(json!({"query": "rust async", "max_results": 2}))
        .await
        .unwrap();

    assert_eq!(body["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_search_web_error_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let tool = search_web_tool(Some(server.uri()));
    let err = tool.invoke(json!({"query": "rust"})).await.unwrap_err();

    assert!(err.to_string().contains("503"));
}
