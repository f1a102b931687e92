use panel_backup::config::PanelConfig;
use panel_backup::core::{BackupHost, CreateOutcome, JobId, JobStatus, PanelClient};
use panel_backup::error::RemoteError;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BACKUPS: &str = "/api/client/servers/srv1/backups";

fn client(server: &MockServer) -> PanelClient {
    PanelClient::new(&PanelConfig {
        url: server.uri(),
        api_key: "ptlc_key".into(),
        server_id: "srv1".into(),
    })
    .unwrap()
}

#[tokio::test]
async fn create_returns_backup_uuid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(BACKUPS))
        .and(header("authorization", "Bearer ptlc_key"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "backup",
            "attributes": { "uuid": "abc", "is_successful": false, "completed_at": null }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client(&server).create_job().await.unwrap();
    assert_eq!(outcome, CreateOutcome::Created(JobId::new("abc")));
}

#[tokio::test]
async fn create_without_uuid_is_rejected_with_body() {
    let server = MockServer::start().await;
    let body = r#"{"errors":[{"code":"TooManyBackupsException"}]}"#;
    Mock::given(method("POST"))
        .and(path(BACKUPS))
        .respond_with(ResponseTemplate::new(400).set_body_string(body))
        .mount(&server)
        .await;

    let outcome = client(&server).create_job().await.unwrap();
    assert_eq!(
        outcome,
        CreateOutcome::Rejected {
            body: body.to_string()
        }
    );
}

#[tokio::test]
async fn status_reports_completion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/abc", BACKUPS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "attributes": {
                "uuid": "abc",
                "is_successful": true,
                "completed_at": "2024-05-01T12:30:00+00:00"
            }
        })))
        .mount(&server)
        .await;

    let progress = client(&server)
        .get_status(&JobId::new("abc"))
        .await
        .unwrap();
    assert!(progress.is_complete);
    assert_eq!(progress.status(), JobStatus::Succeeded);
}

#[tokio::test]
async fn unparseable_status_is_not_complete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/abc", BACKUPS)))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let progress = client(&server)
        .get_status(&JobId::new("abc"))
        .await
        .unwrap();
    assert!(!progress.is_complete);
}

#[tokio::test]
async fn status_error_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/abc", BACKUPS)))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let err = client(&server)
        .get_status(&JobId::new("abc"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Status { status, .. } if status.as_u16() == 502));
}

#[tokio::test]
async fn download_descriptor_returns_signed_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/abc/download", BACKUPS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "signed_url",
            "attributes": { "url": "https://node.example.com/download/backup?token=xyz" }
        })))
        .mount(&server)
        .await;

    let url = client(&server)
        .get_download_descriptor(&JobId::new("abc"))
        .await
        .unwrap();
    assert_eq!(url.host_str(), Some("node.example.com"));
    assert_eq!(url.query(), Some("token=xyz"));
}

#[tokio::test]
async fn download_descriptor_without_url_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/abc/download", BACKUPS)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "attributes": {} })))
        .mount(&server)
        .await;

    let err = client(&server)
        .get_download_descriptor(&JobId::new("abc"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::MissingField { field: "url", .. }));
}

#[tokio::test]
async fn delete_expects_no_content() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/abc", BACKUPS)))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{}/gone", BACKUPS)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client(&server);
    client.delete_job(&JobId::new("abc")).await.unwrap();
    assert!(client.delete_job(&JobId::new("gone")).await.is_err());
}
