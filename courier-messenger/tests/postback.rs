mod support;

use courier_messenger::{Messenger, MessengerError, PostbackConfig, PostbackMessenger};
use pretty_assertions::assert_eq;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{basic_auth, header_exists, method, path},
};

fn config(server: &MockServer, retries: u32) -> PostbackConfig {
    PostbackConfig {
        name: "postback".to_string(),
        root_url: format!("{}/hooks/messages", server.uri()),
        username: Some("courier".to_string()),
        password: Some("secret".to_string()),
        timeout_secs: 5,
        max_connections: 2,
        retries,
    }
}

#[tokio::test]
async fn test_push_posts_message_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/messages"))
        .and(basic_auth("courier", "secret"))
        .and(header_exists("user-agent"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let messenger = PostbackMessenger::new(&config(&server, 0)).unwrap();
    messenger.push(&support::message("postback")).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();

    assert_eq!(payload["subject"], "Autumn sale");
    assert_eq!(payload["content_type"], "html");
    assert_eq!(payload["body"], "<p>Hi Reader</p>");
    assert_eq!(payload["recipients"][0]["email"], "reader@example.org");
    assert_eq!(payload["recipients"][0]["attribs"]["city"], "Lisbon");
    assert_eq!(payload["recipients"][0]["status"], "enabled");
    assert_eq!(payload["campaign"]["name"], "Autumn sale");
    assert_eq!(payload["campaign"]["tags"][0], "sale");
    assert_eq!(payload["campaign"]["headers"][0]["name"], "X-Season");
}

#[tokio::test]
async fn test_non_200_is_retried_then_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let messenger = PostbackMessenger::new(&config(&server, 2)).unwrap();
    let result = messenger.push(&support::message("postback")).await;

    assert!(matches!(result, Err(MessengerError::Status(503))));
}

#[tokio::test]
async fn test_retry_recovers_from_a_single_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let messenger = PostbackMessenger::new(&config(&server, 1)).unwrap();
    messenger.push(&support::message("postback")).await.unwrap();

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
