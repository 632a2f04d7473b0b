//! End-to-end interpreter tests against a local mock server.

use std::sync::Arc;
use std::time::Duration;

use quarry_script::{Env, EvalError, Interpreter, NativeBridge, ScriptError, Value};
use quarry_client::{Client, Settings};
use scraper::Selector;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn quick_settings() -> Settings {
    Settings {
        sleep_per_request: Duration::ZERO,
        retry: 0,
        ..Settings::default()
    }
}

/// A block engine that understands one phrase: extract the page title.
fn title_bridge() -> NativeBridge {
    NativeBridge::with_block_engine(|body, _response, obj| {
        if !body.contains("title") {
            return Err(EvalError::NoBlockEngine);
        }
        let Value::Html(html) = obj else {
            return Err(EvalError::Type {
                expected: "html",
                found: obj.type_name(),
            });
        };
        let selector = Selector::parse("title").map_err(|_| EvalError::HostExpr("title".into()))?;
        let title: String = html
            .select(&selector)
            .next()
            .map(|el| el.text().collect())
            .unwrap_or_default();
        Ok(Value::Str(title))
    })
}

async fn serve_page(server: &MockServer, route: &str, title: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<html><head><title>{title}</title></head><body></body></html>"
        )))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_run_returns_request_value() {
    let interpreter = Interpreter::new(Client::new(quick_settings()));
    let result = interpreter
        .run("get from 'https://example.com/'", Env::new(), Env::new())
        .await
        .unwrap();
    let Value::Request(request) = result else {
        panic!("expected a request value");
    };
    assert_eq!(request.url.as_str(), "https://example.com/");
    interpreter.close().await;
}

#[tokio::test]
async fn test_single_pipeline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/s"))
        .and(query_param("wd", "pipelines"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<html><head><title>pipelines_search</title></head></html>",
        ))
        .mount(&server)
        .await;

    let source = format!(
        "let request = get from '{}/s' with\n\
         \x20               set wd equals 'pipelines' in query\n\
         let future = send request\n\
         let response = wait future\n\
         process response as html with {{{{\n\
         \x20   title of obj\n\
         }}}}",
        server.uri()
    );

    let interpreter =
        Interpreter::with_bridge(Client::new(quick_settings()), Arc::new(title_bridge()));
    let result = interpreter.run(&source, Env::new(), Env::new()).await.unwrap();
    assert_eq!(result, Value::Str("pipelines_search".into()));
    interpreter.close().await;
}

#[tokio::test]
async fn test_multiple_urls() {
    let server = MockServer::start().await;
    serve_page(&server, "/one", "first_page").await;
    serve_page(&server, "/two", "second_page").await;

    let source = format!(
        "let request = get from [\n\
         \x20   '{uri}/one',\n\
         \x20   '{uri}/two',\n\
         ]\n\
         let future = send request\n\
         let responses = wait future\n\
         process responses as html with {{{{ title of obj }}}}",
        uri = server.uri()
    );

    let interpreter =
        Interpreter::with_bridge(Client::new(quick_settings()), Arc::new(title_bridge()));
    let result = interpreter.run(&source, Env::new(), Env::new()).await.unwrap();
    assert_eq!(
        result,
        Value::List(vec![
            Value::Str("first_page".into()),
            Value::Str("second_page".into()),
        ])
    );
    interpreter.close().await;
}

#[tokio::test]
async fn test_implicit_threading() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/s"))
        .and(query_param("wd", "x"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<html><head><title>implicit_title</title></head></html>",
        ))
        .mount(&server)
        .await;

    let source = "url\n\
                  then get from with\n\
                  \x20       set wd equals 'x' in query\n\
                  then send\n\
                  then wait\n\
                  then process as html with {{\n\
                  \x20   title of obj\n\
                  }}";
    let mut global = Env::new();
    global.insert("url".into(), Value::Str(format!("{}/s", server.uri())));

    let interpreter =
        Interpreter::with_bridge(Client::new(quick_settings()), Arc::new(title_bridge()));
    let result = interpreter.run(source, global, Env::new()).await.unwrap();
    assert_eq!(result, Value::Str("implicit_title".into()));
    interpreter.close().await;
}

#[tokio::test]
async fn test_branch_over_live_responses() {
    let server = MockServer::start().await;
    serve_page(&server, "/ok", "served").await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
        .mount(&server)
        .await;

    let source = format!(
        "let future = send get from [ '{uri}/ok', '{uri}/missing' ]\n\
         let responses = wait future\n\
         process responses\n\
         \x20   whose status equals 200 as html with {{{{ title of obj }}}}\n\
         \x20   otherwise as str with keep",
        uri = server.uri()
    );
    let mut local = Env::new();
    local.insert(
        "keep".into(),
        Value::native(|response, obj| {
            let Value::Str(text) = obj else {
                return Err(EvalError::Type {
                    expected: "str",
                    found: obj.type_name(),
                });
            };
            Ok(Value::Str(format!("{} {}", response.status(), text)))
        }),
    );

    let interpreter =
        Interpreter::with_bridge(Client::new(quick_settings()), Arc::new(title_bridge()));
    let result = interpreter.run(&source, Env::new(), local).await.unwrap();
    assert_eq!(
        result,
        Value::List(vec![
            Value::Str("served".into()),
            Value::Str("404 gone".into()),
        ])
    );
    interpreter.close().await;
}

#[tokio::test]
async fn test_parse_error_is_fatal() {
    let interpreter = Interpreter::new(Client::new(quick_settings()));
    let err = interpreter.run("let a b", Env::new(), Env::new()).await.unwrap_err();
    let ScriptError::Parse(parse) = err else {
        panic!("expected a parse error");
    };
    assert_eq!(parse.to_string(), "Expected: =, got: b, at line 1");
    interpreter.close().await;
}

#[tokio::test]
async fn test_unterminated_string_is_fatal() {
    let interpreter = Interpreter::new(Client::new(quick_settings()));
    let err = interpreter.run("\"abc", Env::new(), Env::new()).await.unwrap_err();
    assert!(err.to_string().contains("EOF"), "{err}");
    interpreter.close().await;
}
