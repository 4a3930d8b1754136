//! Wire-level tests for the built-in adapters.
//!
//! REST, FHIR and EDI adapters run against a wiremock server; the HL7 adapter
//! talks MLLP to a local TCP listener.

#![allow(clippy::unwrap_used)]

use carelink_core::{models::metadata_keys, IntegrationType};
use carelink_sync::{
    adapters::{
        edi::EdiTransactionType,
        hl7::{frame, FrameDecoder},
        rest::{ALLSCRIPTS, EPIC},
        EdiAdapter, FhirAdapter, Hl7Adapter, IntegrationAdapter, RestAdapter,
    },
    AdapterSettings, IntegrationError,
};
use carelink_testing::TestEnv;
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use wiremock::{matchers, Mock, ResponseTemplate};

fn token_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok-1", "expires_in": 3600}))
}

#[tokio::test]
async fn epic_sync_authenticates_once_and_follows_bundle_pages() {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/oauth2/token"))
        .and(matchers::body_string_contains("grant_type=client_credentials"))
        .and(matchers::body_string_contains("client_id=epic-client"))
        .respond_with(token_response())
        .expect(1)
        .mount(&env.http_mock)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/Patient"))
        .and(matchers::query_param("_count", "100"))
        .and(matchers::header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [{"resource": {"id": "p1"}}, {"resource": {"id": "p2"}}],
            "link": [{"relation": "next", "url": env.mock_url("/Patient?page=2")}]
        })))
        .expect(1)
        .mount(&env.http_mock)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/Patient"))
        .and(matchers::query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [{"resource": {"id": "p3"}}]
        })))
        .expect(1)
        .mount(&env.http_mock)
        .await;

    let adapter = RestAdapter::new(&EPIC, &AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env.config(IntegrationType::Epic).oauth_client("epic-client", "s3cret").build();

    let result = adapter.sync(&config).await.unwrap();
    assert_eq!(result.records_processed, 3);
    assert_eq!(result.data[2], json!({"id": "p3"}));
    assert_eq!(result.message, "Epic sync completed");
}

#[tokio::test]
async fn unauthorized_response_drops_cached_token() {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/oauth2/token"))
        .respond_with(token_response())
        .expect(2)
        .mount(&env.http_mock)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/Patient"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&env.http_mock)
        .await;

    let adapter = RestAdapter::new(&EPIC, &AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env.config(IntegrationType::Epic).oauth_client("id", "secret").build();

    for _ in 0..2 {
        let err = adapter.sync(&config).await.unwrap_err();
        assert!(matches!(err, IntegrationError::Authentication { .. }));
    }
}

#[tokio::test]
async fn rejected_token_request_is_authentication_error() {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&env.http_mock)
        .await;

    let adapter = RestAdapter::new(&EPIC, &AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env.config(IntegrationType::Epic).oauth_client("id", "wrong").build();

    let err = adapter.sync(&config).await.unwrap_err();
    assert!(matches!(err, IntegrationError::Authentication { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn proprietary_vendor_stops_at_page_limit() {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/oauth2/token"))
        .respond_with(token_response())
        .mount(&env.http_mock)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{"id": "a1"}, {"id": "a2"}],
            "nextPage": "/appointments?page=2"
        })))
        .expect(1)
        .mount(&env.http_mock)
        .await;

    let adapter =
        RestAdapter::new(&ALLSCRIPTS, &AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env
        .config(IntegrationType::Allscripts)
        .oauth_client("id", "secret")
        .metadata(metadata_keys::SYNC_TYPE, "appointments")
        .metadata(metadata_keys::MAX_PAGES, 1)
        .build();

    let result = adapter.sync(&config).await.unwrap();
    assert_eq!(result.records_processed, 2);
}

#[tokio::test]
async fn unrecognized_collection_body_fails_the_sync() {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/oauth2/token"))
        .respond_with(token_response())
        .mount(&env.http_mock)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/patients"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"error": "maintenance", "status": 42})),
        )
        .mount(&env.http_mock)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/clinical"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&env.http_mock)
        .await;

    let adapter =
        RestAdapter::new(&ALLSCRIPTS, &AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env.config(IntegrationType::Allscripts).oauth_client("id", "secret").build();

    let err = adapter.sync(&config).await.unwrap_err();
    assert!(
        matches!(err, IntegrationError::Adapter { ref message } if message.contains("unexpected response shape"))
    );
    assert!(!err.is_retryable());

    let clinical = env
        .config(IntegrationType::Allscripts)
        .oauth_client("id", "secret")
        .metadata(metadata_keys::SYNC_TYPE, "clinical")
        .build();
    let err = adapter.sync(&clinical).await.unwrap_err();
    assert!(matches!(err, IntegrationError::Adapter { ref message } if message.contains("empty body")));
}

#[tokio::test]
async fn fhir_search_answered_with_operation_outcome_fails() {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/auth/token"))
        .respond_with(token_response())
        .mount(&env.http_mock)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/Patient"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "too-costly"}]
        })))
        .mount(&env.http_mock)
        .await;

    let adapter = FhirAdapter::new(&AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env.config(IntegrationType::Fhir).oauth_client("id", "secret").build();

    let err = adapter.sync(&config).await.unwrap_err();
    assert!(
        matches!(err, IntegrationError::Adapter { ref message } if message.contains("OperationOutcome"))
    );
}

#[tokio::test]
async fn unknown_sync_type_is_adapter_error() {
    let env = TestEnv::new().await;
    let adapter = RestAdapter::new(&EPIC, &AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env
        .config(IntegrationType::Epic)
        .oauth_client("id", "secret")
        .metadata(metadata_keys::SYNC_TYPE, "billing")
        .build();

    let err = adapter.sync(&config).await.unwrap_err();
    assert!(matches!(err, IntegrationError::Adapter { ref message } if message.contains("billing")));
}

#[tokio::test]
async fn missing_credentials_fail_validation_before_network() {
    let env = TestEnv::new().await;
    let adapter = RestAdapter::new(&EPIC, &AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env.config(IntegrationType::Epic).build();

    assert!(matches!(adapter.validate_config(&config), Err(IntegrationError::Configuration { .. })));
    assert!(!adapter.test_connection(&config).await);
    assert!(env.http_mock.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_vendor_is_network_error() {
    let env = TestEnv::new().await;
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let adapter = RestAdapter::new(&EPIC, &AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env
        .config(IntegrationType::Epic)
        .endpoint(format!("http://127.0.0.1:{port}"))
        .oauth_client("id", "secret")
        .build();

    let err = adapter.sync(&config).await.unwrap_err();
    assert!(matches!(err, IntegrationError::Network { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn fhir_search_summarizes_bundle_resources() {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/auth/token"))
        .and(matchers::body_partial_json(json!({
            "grant_type": "client_credentials",
            "client_id": "fhir-client",
            "scope": "system/*.read system/*.write"
        })))
        .respond_with(token_response())
        .expect(1)
        .mount(&env.http_mock)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/Observation"))
        .and(matchers::query_param("patient", "p1"))
        .and(matchers::header("accept", "application/fhir+json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [{
                "resource": {
                    "resourceType": "Observation",
                    "id": "o1",
                    "meta": {"lastUpdated": "2024-03-01T10:00:00Z"},
                    "status": "final"
                }
            }]
        })))
        .expect(1)
        .mount(&env.http_mock)
        .await;

    let adapter = FhirAdapter::new(&AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env
        .config(IntegrationType::Fhir)
        .oauth_client("fhir-client", "secret")
        .metadata(metadata_keys::RESOURCE_TYPE, "Observation")
        .metadata(metadata_keys::SEARCH_PARAMS, json!({"patient": "p1"}))
        .build();

    let result = adapter.sync(&config).await.unwrap();
    assert_eq!(result.data, vec![json!({
        "id": "o1",
        "resourceType": "Observation",
        "lastUpdated": "2024-03-01T10:00:00Z"
    })]);
}

#[tokio::test]
async fn fhir_connection_test_reads_capability_statement() {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/auth/token"))
        .respond_with(token_response())
        .mount(&env.http_mock)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/metadata"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"resourceType": "CapabilityStatement"})),
        )
        .up_to_n_times(1)
        .mount(&env.http_mock)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/metadata"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&env.http_mock)
        .await;

    let adapter = FhirAdapter::new(&AdapterSettings::default(), env.clock_handle()).unwrap();
    let config = env.config(IntegrationType::Fhir).oauth_client("id", "secret").build();

    assert!(adapter.test_connection(&config).await);
    assert!(!adapter.test_connection(&config).await);
}

const CLAIM: &str = "ISA*00*          *00*          *ZZ*SENDER*ZZ*RECEIVER*240101*1200*^*00501*000000001*0*P*:~\
GS*HC*SENDER*RECEIVER*20240101*1200*1*X*005010X222A1~ST*837*0001*005010X222A1~BHT*0019*00*1~\
SE*3*0001~GE*1*1~IEA*1*000000001~";

#[tokio::test]
async fn edi_sync_parses_transactions_and_counts_malformed_ones() {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/transactions"))
        .and(matchers::query_param("type", "837"))
        .and(matchers::header("x-api-key", "edi-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([CLAIM, "GS*HC*X~GE*1*1~"])))
        .expect(1)
        .mount(&env.http_mock)
        .await;

    let adapter = EdiAdapter::new(&AdapterSettings::default()).unwrap();
    let config = env.config(IntegrationType::Edi).api_key("edi-key").build();

    let result = adapter.sync(&config).await.unwrap();
    assert_eq!(result.records_processed, 2);
    assert_eq!(result.records_failed, 1);
    assert_eq!(result.data[0]["transactionType"], "837");
    assert_eq!(result.data[0]["controlNumber"], "0001");
    assert_eq!(result.data[1]["status"], "error");
}

#[tokio::test]
async fn edi_submit_returns_transaction_id() {
    let env = TestEnv::new().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/transactions"))
        .and(matchers::query_param("type", "270"))
        .and(matchers::header("authorization", "Basic dXNlcjpwYXNz"))
        .and(matchers::body_string_contains("ST*837*0001"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"transactionId": "tx-42"})))
        .expect(1)
        .mount(&env.http_mock)
        .await;

    let adapter = EdiAdapter::new(&AdapterSettings::default()).unwrap();
    let config =
        env.config(IntegrationType::Edi).credential("username", "user").credential("password", "pass").build();

    let id = adapter
        .submit_transaction(&config, EdiTransactionType::Eligibility270, CLAIM)
        .await
        .unwrap();
    assert_eq!(id, "tx-42");
}

#[tokio::test]
async fn edi_without_auth_is_rejected() {
    let env = TestEnv::new().await;
    let adapter = EdiAdapter::new(&AdapterSettings::default()).unwrap();
    let config = env.config(IntegrationType::Edi).credential("token", "x").build();
    assert!(matches!(adapter.validate_config(&config), Err(IntegrationError::Configuration { .. })));
}

const ADT: &str = "MSH|^~\\&|LAB|HOSP|CARELINK|COUNTY|20240101120000||ADT^A01|MSG0001|P|2.5\rPID|1||12345";
const ORU: &str = "MSH|^~\\&|LAB|HOSP|CARELINK|COUNTY|20240101120500||ORU^R01|MSG0002|P|2.5\rOBX|1|NM|GLU";

#[tokio::test]
async fn hl7_sync_reads_framed_messages_until_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut batch = frame(ADT);
        batch.extend(frame(ORU));
        batch.extend(frame("PID|1||no-header"));
        socket.write_all(&batch).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let env = TestEnv::new().await;
    let adapter = Hl7Adapter::new(&AdapterSettings::default());
    let config = env.config(IntegrationType::Hl7).endpoint(format!("mllp://127.0.0.1:{port}")).build();

    let result = adapter.sync(&config).await.unwrap();
    server.await.unwrap();

    assert_eq!(result.records_processed, 3);
    assert_eq!(result.records_failed, 1);
    assert_eq!(result.data[0]["type"], "ADT");
    assert_eq!(result.data[0]["controlId"], "MSG0001");
    assert_eq!(result.data[1]["type"], "ORU");
    assert_eq!(result.data[2]["status"], "error");
}

#[tokio::test]
async fn hl7_send_waits_for_acknowledgment() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::default();
        let mut buf = [0_u8; 1024];
        let received = loop {
            if let Some(message) = decoder.next_frame() {
                break message;
            }
            let n = socket.read(&mut buf).await.unwrap();
            decoder.push(&buf[..n]).unwrap();
        };
        socket.write_all(&frame("MSH|^~\\&|HOSP||||||ACK|MSG0001|P|2.5\rMSA|AA|MSG0001")).await.unwrap();
        received
    });

    let env = TestEnv::new().await;
    let adapter = Hl7Adapter::new(&AdapterSettings::default());
    let config = env.config(IntegrationType::Hl7).endpoint(format!("127.0.0.1:{port}")).build();

    let ack = adapter.send_message(&config, ADT).await.unwrap();
    assert!(ack.contains("MSA|AA|MSG0001"));
    assert_eq!(server.await.unwrap(), ADT);
}

#[tokio::test]
async fn hl7_refused_connection_is_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let env = TestEnv::new().await;
    let adapter = Hl7Adapter::new(&AdapterSettings::default());
    let config = env.config(IntegrationType::Hl7).endpoint(format!("mllp://127.0.0.1:{port}")).build();

    assert!(matches!(adapter.sync(&config).await, Err(IntegrationError::Network { .. })));
    assert!(!adapter.test_connection(&config).await);
}
