//! Object storage source against a live S3-compatible endpoint.
//!
//! Skipped unless `S3_ENDPOINT` is set, e.g. for a local MinIO:
//!
//! ```text
//! S3_ENDPOINT=http://localhost:9000 S3_ACCESS_KEY=minioadmin \
//!     S3_SECRET_KEY=minioadmin S3_BUCKET=dsc-test cargo test --test object_store_test
//! ```

mod common;

use aws_sdk_s3::primitives::ByteStream;
use common::*;
use dsc_common::types::TransferId;
use dsc_transfer::{
    Credentials, DefaultAdapters, EndpointReference, HttpSinkMode, MemoryTransferStore,
    SessionControl, SessionOutcome, SinkSpec, SourceSpec, TransferDescriptor, TransferSession,
};
use std::sync::Arc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

struct S3Env {
    endpoint: String,
    access_key: String,
    secret_key: String,
    bucket: String,
}

fn s3_env() -> Option<S3Env> {
    let endpoint = std::env::var("S3_ENDPOINT").ok()?;
    Some(S3Env {
        endpoint,
        access_key: std::env::var("S3_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".into()),
        secret_key: std::env::var("S3_SECRET_KEY").unwrap_or_else(|_| "minioadmin".into()),
        bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| "dsc-test".into()),
    })
}

async fn upload(env: &S3Env, key: &str, data: Vec<u8>) {
    let config = aws_sdk_s3::Config::builder()
        .credentials_provider(aws_credential_types::Credentials::new(
            &env.access_key,
            &env.secret_key,
            None,
            None,
            "object-store-test",
        ))
        .region(aws_sdk_s3::config::Region::new("us-east-1"))
        .endpoint_url(&env.endpoint)
        .force_path_style(true)
        .build();
    let client = aws_sdk_s3::Client::from_conf(config);

    let _ = client.create_bucket().bucket(&env.bucket).send().await;
    client
        .put_object()
        .bucket(&env.bucket)
        .key(key)
        .body(ByteStream::from(data))
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_object_streams_to_http_sink() {
    let Some(env) = s3_env() else {
        eprintln!("S3_ENDPOINT not set, skipping object storage test");
        return;
    };

    let key = format!("transfers/{}.bin", TransferId::generate());
    upload(&env, &key, payload(250 * KB)).await;

    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let descriptor = TransferDescriptor::new(
        "tp-s3".into(),
        SourceSpec::ObjectStorage {
            bucket: env.bucket.clone(),
            key,
            region: None,
            path_style: true,
        },
        SinkSpec::Http {
            url: format!("{}/ingest", server.uri()),
            mode: HttpSinkMode::Ranged,
            auth_key: None,
            part_name: None,
            resume_granularity: None,
        },
        EndpointReference {
            endpoint: env.endpoint.clone(),
            credentials: Credentials::AccessKey {
                access_key_id: env.access_key.clone(),
                secret_access_key: env.secret_key.clone(),
                session_token: None,
            },
            expires_at: None,
        },
    );

    let (manager, _events) = manager(Arc::new(MemoryTransferStore::new()));
    let config = config(100 * KB);
    let (_control, rx) = SessionControl::new();
    let outcome = TransferSession::new(
        manager,
        Arc::new(DefaultAdapters::new(&config).unwrap()),
        &config,
        rx,
    )
    .start(descriptor)
    .await
    .unwrap();
    assert_eq!(outcome, SessionOutcome::Completed { bytes: 250 * KB as u64 });

    let mut received = Vec::new();
    for request in server.received_requests().await.unwrap() {
        received.extend_from_slice(&request.body);
    }
    assert_eq!(received, payload(250 * KB));
}
