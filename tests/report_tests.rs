mod common;

use std::time::Duration;

use common::{closed_port_url, MockManagement};
use zepsec_agent::config::{DeliveryConfig, ServerConfig};
use zepsec_agent::error::{AttemptFailure, DeliveryError};
use zepsec_agent::report::ReportDelivery;
use zepsec_agent::types::{AddressReport, HostReport, ReportPayload};

const BASE: Duration = Duration::from_millis(10);

fn delivery(url: &str) -> ReportDelivery {
    delivery_with_base(url, BASE)
}

fn delivery_with_base(url: &str, backoff_base: Duration) -> ReportDelivery {
    let server = ServerConfig {
        url: url.to_string(),
        api_token: "tok-123".into(),
        verify_tls: true,
    };
    let cfg = DeliveryConfig {
        max_retries: 3,
        backoff_base,
        request_timeout: Duration::from_secs(5),
    };
    ReportDelivery::new(&server, &cfg).unwrap()
}

fn payload() -> ReportPayload {
    ReportPayload {
        jid: "j1".into(),
        external_ip: "203.0.113.7".into(),
        hosts: vec![HostReport {
            addresses: vec![AddressReport {
                addr_type: "ipv4".into(),
                addr: "10.0.0.1".into(),
            }],
            start_time: 1,
            end_time: 2,
            ports: vec![],
        }],
    }
}

#[tokio::test]
async fn retries_server_errors_with_growing_backoff() {
    let (url, mock) = MockManagement::spawn(&[500, 500, 500, 200]).await;
    delivery(&url).send(&payload()).await.expect("fourth attempt succeeds");

    let reqs = mock.requests();
    assert_eq!(reqs.len(), 4);
    let gaps: Vec<Duration> = reqs.windows(2).map(|w| w[1].at - w[0].at).collect();
    assert!(gaps[0] >= BASE * 2, "{gaps:?}");
    assert!(gaps[1] >= BASE * 4, "{gaps:?}");
    assert!(gaps[2] >= BASE * 8, "{gaps:?}");
    assert!(gaps[0] < gaps[1] && gaps[1] < gaps[2], "{gaps:?}");
}

#[tokio::test]
async fn client_error_is_terminal() {
    let (url, mock) = MockManagement::spawn(&[404, 200]).await;
    let base = Duration::from_millis(500);
    let start = tokio::time::Instant::now();
    let err = delivery_with_base(&url, base).send(&payload()).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Rejected { status: 404, .. }), "{err}");
    assert_eq!(mock.requests().len(), 1);
    // no backoff sleep happened
    assert!(start.elapsed() < base * 2);
}

#[tokio::test]
async fn gives_up_after_four_attempts() {
    let (url, mock) = MockManagement::spawn(&[503, 502, 500, 500, 200]).await;
    let err = delivery(&url).send(&payload()).await.unwrap_err();

    match err {
        DeliveryError::Exhausted {
            attempts,
            last: AttemptFailure::Status { status, .. },
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(status, 500);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mock.requests().len(), 4);
}

#[tokio::test]
async fn transport_failures_are_retried() {
    let url = closed_port_url().await;
    let err = delivery(&url).send(&payload()).await.unwrap_err();
    assert!(
        matches!(
            err,
            DeliveryError::Exhausted {
                attempts: 4,
                last: AttemptFailure::Transport(_)
            }
        ),
        "{err}"
    );
}

#[tokio::test]
async fn posts_json_with_token_header_to_results_path() {
    let (url, mock) = MockManagement::spawn(&[]).await;
    delivery(&format!("{url}/")).send(&payload()).await.unwrap();

    let req = &mock.requests()[0];
    assert_eq!(req.path, "/api/v1/ra_api");
    assert_eq!(req.authorization.as_deref(), Some("Token token=\"tok-123\""));
    assert_eq!(req.content_type.as_deref(), Some("application/json"));

    let body: serde_json::Value = serde_json::from_str(&req.body).unwrap();
    assert_eq!(body["jid"], "j1");
    assert_eq!(body["externalip"], "203.0.113.7");
    assert_eq!(body["hosts"][0]["addresses"][0]["addrtype"], "ipv4");
    assert_eq!(body["hosts"][0]["starttime"], 1);
}
