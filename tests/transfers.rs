use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use panel_backup::core::transfer::upload::CHUNK_GRANULARITY;
use panel_backup::core::{Credential, CredentialProvider, Downloader, RetryPolicy, Uploader};
use panel_backup::error::{AuthError, TransferError};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn downloader(max_attempts: u32) -> Downloader {
    Downloader::new(
        RetryPolicy::bounded(max_attempts, Duration::ZERO),
        Duration::from_secs(5),
    )
    .unwrap()
}

/// Hands out `tokens` in order: the first on request, the next on each renewal.
struct TokenSequence {
    tokens: Vec<&'static str>,
    issued: AtomicUsize,
}

impl TokenSequence {
    fn new(tokens: &[&'static str]) -> Self {
        Self {
            tokens: tokens.to_vec(),
            issued: AtomicUsize::new(0),
        }
    }

    fn renewals(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    fn credential(&self, index: usize) -> Credential {
        let token = self.tokens[index.min(self.tokens.len() - 1)];
        Credential::new(token, None, Utc::now() + ChronoDuration::hours(1))
    }
}

#[async_trait]
impl CredentialProvider for TokenSequence {
    async fn get_valid_credential(&self) -> Result<Credential, AuthError> {
        Ok(self.credential(self.renewals()))
    }

    async fn renew_credential(&self, _rejected: &Credential) -> Result<Credential, AuthError> {
        let next = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.credential(next))
    }
}

fn credentials() -> TokenSequence {
    TokenSequence::new(&["ya29.token"])
}

async fn mount_session(server: &MockServer, location: &str) {
    Mock::given(method("POST"))
        .and(path("/upload/drive/v3/files"))
        .and(query_param("uploadType", "resumable"))
        .and(header("authorization", "Bearer ya29.token"))
        .respond_with(ResponseTemplate::new(200).insert_header("Location", location))
        .expect(1)
        .mount(server)
        .await;
}

/// Chunk bodies Drive received, in order.
async fn uploaded_bytes(server: &MockServer) -> Vec<u8> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "PUT" && !r.body.is_empty())
        .flat_map(|r| r.body)
        .collect()
}

#[tokio::test]
async fn download_resumes_partial_file_after_transient_failures() {
    let server = MockServer::start().await;
    let body = payload(100);

    Mock::given(method("GET"))
        .and(header("range", "bytes=40-"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(4)
        .expect(4)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("range", "bytes=40-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 40-99/100")
                .set_body_bytes(body[40..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let dest = temp.path().join("backup.tar.gz");
    std::fs::write(&dest, &body[..40]).unwrap();
    let url = Url::parse(&format!("{}/download", server.uri())).unwrap();

    let outcome = downloader(5).download(&url, &dest).await.unwrap();

    assert_eq!(outcome.total_bytes, 100);
    assert_eq!(outcome.bytes_transferred, 60);
    assert_eq!(outcome.attempts, 5);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn download_short_partial_response_resumes_from_new_offset() {
    let server = MockServer::start().await;
    let body = payload(100);

    Mock::given(method("GET"))
        .and(header("range", "bytes=20-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 20-99/100")
                .set_body_bytes(body[20..60].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("range", "bytes=60-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 60-99/100")
                .set_body_bytes(body[60..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let dest = temp.path().join("backup.tar.gz");
    std::fs::write(&dest, &body[..20]).unwrap();
    let url = Url::parse(&format!("{}/download", server.uri())).unwrap();

    let outcome = downloader(5).download(&url, &dest).await.unwrap();

    assert_eq!(outcome.attempts, 2);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

/// Read one request head from `socket`.
async fn read_request_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&head).to_lowercase()
}

#[tokio::test]
async fn download_keeps_bytes_received_before_connection_drop() {
    let body = payload(100);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let served = body.clone();
    let server = tokio::spawn(async move {
        // The first response promises 100 bytes and hangs up after 40.
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_head(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n")
            .await
            .unwrap();
        socket.write_all(&served[..40]).await.unwrap();
        socket.shutdown().await.unwrap();
        drop(socket);

        let (mut socket, _) = listener.accept().await.unwrap();
        let resumed = read_request_head(&mut socket).await;
        socket
            .write_all(
                b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 40-99/100\r\n\
                  Content-Length: 60\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        socket.write_all(&served[40..]).await.unwrap();
        socket.shutdown().await.unwrap();
        resumed
    });

    let temp = tempdir().unwrap();
    let dest = temp.path().join("backup.tar.gz");
    let url = Url::parse(&format!("http://{}/download", addr)).unwrap();

    let outcome = downloader(3).download(&url, &dest).await.unwrap();
    let resumed = server.await.unwrap();

    assert!(resumed.contains("range: bytes=40-"), "{}", resumed);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn download_gives_up_after_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(5)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let dest = temp.path().join("backup.tar.gz");
    let url = Url::parse(&format!("{}/download", server.uri())).unwrap();

    let err = downloader(5).download(&url, &dest).await.unwrap_err();
    assert!(matches!(err, TransferError::RetriesExhausted { attempts: 5, .. }));
}

#[tokio::test]
async fn upload_sends_granular_chunks_until_created() {
    let server = MockServer::start().await;
    let total = 2 * CHUNK_GRANULARITY + 100;
    let body = payload(total);
    mount_session(&server, &format!("{}/session/s1", server.uri())).await;

    Mock::given(method("PUT"))
        .and(path("/session/s1"))
        .and(header("content-range", format!("bytes 0-262143/{}", total).as_str()))
        .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-262143"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/session/s1"))
        .and(header("content-range", format!("bytes 262144-524287/{}", total).as_str()))
        .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-524287"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/session/s1"))
        .and(header("content-range", format!("bytes 524288-{}/{}", total - 1, total).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "drive123" })))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let file = temp.path().join("backup-srv-2024-05-01_00-00-00.tar.gz");
    std::fs::write(&file, &body).unwrap();

    let uploader = Uploader::new(
        RetryPolicy::unbounded(Duration::ZERO),
        &server.uri(),
        CHUNK_GRANULARITY,
    )
    .unwrap();
    let id = uploader
        .upload(&file, "folder1", "application/gzip", &credentials())
        .await
        .unwrap();

    assert_eq!(id, "drive123");
    assert_eq!(uploaded_bytes(&server).await, body);
}

#[tokio::test]
async fn upload_session_request_carries_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload/drive/v3/files"))
        .and(header("x-upload-content-type", "application/gzip"))
        .and(header("x-upload-content-length", "10"))
        .and(wiremock::matchers::body_json(json!({
            "name": "backup.tar.gz",
            "parents": ["folder1"]
        })))
        .respond_with(ResponseTemplate::new(200).insert_header("Location", "/session/rel"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/session/rel"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "f1" })))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let file = temp.path().join("backup.tar.gz");
    std::fs::write(&file, payload(10)).unwrap();

    let uploader = Uploader::new(
        RetryPolicy::unbounded(Duration::ZERO),
        &server.uri(),
        CHUNK_GRANULARITY,
    )
    .unwrap();
    let id = uploader
        .upload(&file, "folder1", "application/gzip", &credentials())
        .await
        .unwrap();
    assert_eq!(id, "f1");
}

#[tokio::test]
async fn upload_queries_offset_and_resends_after_server_error() {
    let server = MockServer::start().await;
    let total = CHUNK_GRANULARITY + 500;
    let body = payload(total);
    mount_session(&server, &format!("{}/session/s2", server.uri())).await;

    let first_chunk = format!("bytes 0-262143/{}", total);
    Mock::given(method("PUT"))
        .and(header("content-range", first_chunk.as_str()))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(header("content-range", format!("bytes */{}", total).as_str()))
        .respond_with(ResponseTemplate::new(308))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(header("content-range", first_chunk.as_str()))
        .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-262143"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(header("content-range", format!("bytes 262144-{}/{}", total - 1, total).as_str()))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "drive456" })))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let file = temp.path().join("backup.tar.gz");
    std::fs::write(&file, &body).unwrap();

    let uploader = Uploader::new(
        RetryPolicy::unbounded(Duration::ZERO),
        &server.uri(),
        CHUNK_GRANULARITY,
    )
    .unwrap();
    let id = uploader
        .upload(&file, "folder1", "application/gzip", &credentials())
        .await
        .unwrap();
    assert_eq!(id, "drive456");
}

#[tokio::test]
async fn bounded_upload_policy_gives_up() {
    let server = MockServer::start().await;
    mount_session(&server, &format!("{}/session/s3", server.uri())).await;
    Mock::given(method("PUT"))
        .and(path("/session/s3"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let file = temp.path().join("backup.tar.gz");
    std::fs::write(&file, payload(10)).unwrap();

    let uploader = Uploader::new(
        RetryPolicy::bounded(2, Duration::ZERO),
        &server.uri(),
        CHUNK_GRANULARITY,
    )
    .unwrap();
    let err = uploader
        .upload(&file, "folder1", "application/gzip", &credentials())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::RetriesExhausted { attempts: 2, .. }));
}

#[tokio::test]
async fn bare_resume_incomplete_counts_against_bounded_policy() {
    let server = MockServer::start().await;
    mount_session(&server, &format!("{}/session/s6", server.uri())).await;
    // Drive keeps answering 308 without ever committing a byte.
    Mock::given(method("PUT"))
        .and(path("/session/s6"))
        .respond_with(ResponseTemplate::new(308))
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let file = temp.path().join("backup.tar.gz");
    std::fs::write(&file, payload(10)).unwrap();

    let uploader = Uploader::new(
        RetryPolicy::bounded(2, Duration::ZERO),
        &server.uri(),
        CHUNK_GRANULARITY,
    )
    .unwrap();
    let err = uploader
        .upload(&file, "folder1", "application/gzip", &credentials())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::RetriesExhausted { attempts: 2, .. }));
}

#[tokio::test]
async fn rejected_token_is_renewed_and_upload_resumes() {
    let server = MockServer::start().await;
    let total = CHUNK_GRANULARITY + 10;
    let body = payload(total);

    Mock::given(method("POST"))
        .and(path("/upload/drive/v3/files"))
        .and(header("authorization", "Bearer token-a"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Location", format!("{}/session/s7", server.uri()).as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(header("authorization", "Bearer token-a"))
        .and(header("content-range", format!("bytes 0-262143/{}", total).as_str()))
        .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-262143"))
        .expect(1)
        .mount(&server)
        .await;
    // The token expires mid-upload.
    Mock::given(method("PUT"))
        .and(header("authorization", "Bearer token-a"))
        .and(header("content-range", format!("bytes 262144-{}/{}", total - 1, total).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(header("authorization", "Bearer token-b"))
        .and(header("content-range", format!("bytes */{}", total).as_str()))
        .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-262143"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(header("authorization", "Bearer token-b"))
        .and(header("content-range", format!("bytes 262144-{}/{}", total - 1, total).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "drive789" })))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let file = temp.path().join("backup.tar.gz");
    std::fs::write(&file, &body).unwrap();

    let credentials = TokenSequence::new(&["token-a", "token-b"]);
    let uploader = Uploader::new(
        RetryPolicy::bounded(1, Duration::ZERO),
        &server.uri(),
        CHUNK_GRANULARITY,
    )
    .unwrap();
    let id = uploader
        .upload(&file, "folder1", "application/gzip", &credentials)
        .await
        .unwrap();

    assert_eq!(id, "drive789");
    assert_eq!(credentials.renewals(), 1);
}

#[tokio::test]
async fn rejected_token_on_session_start_is_renewed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload/drive/v3/files"))
        .and(header("authorization", "Bearer token-a"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload/drive/v3/files"))
        .and(header("authorization", "Bearer token-b"))
        .respond_with(ResponseTemplate::new(200).insert_header("Location", "/session/s8"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/session/s8"))
        .and(header("authorization", "Bearer token-b"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "f8" })))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let file = temp.path().join("backup.tar.gz");
    std::fs::write(&file, payload(10)).unwrap();

    let credentials = TokenSequence::new(&["token-a", "token-b"]);
    let uploader = Uploader::new(
        RetryPolicy::bounded(1, Duration::ZERO),
        &server.uri(),
        CHUNK_GRANULARITY,
    )
    .unwrap();
    let id = uploader
        .upload(&file, "folder1", "application/gzip", &credentials)
        .await
        .unwrap();
    assert_eq!(id, "f8");
}

#[tokio::test]
async fn renewed_token_rejected_again_ends_upload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload/drive/v3/files"))
        .respond_with(ResponseTemplate::new(200).insert_header("Location", "/session/s9"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/session/s9"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let file = temp.path().join("backup.tar.gz");
    std::fs::write(&file, payload(10)).unwrap();

    let credentials = TokenSequence::new(&["token-a", "token-b"]);
    let uploader = Uploader::new(
        RetryPolicy::unbounded(Duration::ZERO),
        &server.uri(),
        CHUNK_GRANULARITY,
    )
    .unwrap();
    let err = uploader
        .upload(&file, "folder1", "application/gzip", &credentials)
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Unauthorized));
    assert_eq!(credentials.renewals(), 1);
}

#[tokio::test]
async fn expired_session_is_not_retried() {
    let server = MockServer::start().await;
    mount_session(&server, &format!("{}/session/s4", server.uri())).await;
    Mock::given(method("PUT"))
        .and(path("/session/s4"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let file = temp.path().join("backup.tar.gz");
    std::fs::write(&file, payload(10)).unwrap();

    let uploader = Uploader::new(
        RetryPolicy::unbounded(Duration::ZERO),
        &server.uri(),
        CHUNK_GRANULARITY,
    )
    .unwrap();
    let err = uploader
        .upload(&file, "folder1", "application/gzip", &credentials())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::SessionExpired));
}

#[tokio::test]
async fn empty_file_is_finalized_in_one_request() {
    let server = MockServer::start().await;
    mount_session(&server, &format!("{}/session/s5", server.uri())).await;
    Mock::given(method("PUT"))
        .and(path("/session/s5"))
        .and(header("content-range", "bytes */0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "empty1" })))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempdir().unwrap();
    let file = temp.path().join("backup.tar.gz");
    std::fs::write(&file, b"").unwrap();

    let uploader = Uploader::new(
        RetryPolicy::unbounded(Duration::ZERO),
        &server.uri(),
        CHUNK_GRANULARITY,
    )
    .unwrap();
    let id = uploader
        .upload(&file, "folder1", "application/gzip", &credentials())
        .await
        .unwrap();
    assert_eq!(id, "empty1");
}
