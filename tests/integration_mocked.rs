/// Integration tests with mocked external APIs
/// Exercises the dialer and webhook clients without hitting real services
use chrono::{FixedOffset, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use loan_crm::errors::AppError;
use loan_crm::models::{Appointment, AppointmentStatus, SubjectKind};
use loan_crm::playbook_client::PlaybookClient;
use loan_crm::scheduler::AppointmentDetails;
use loan_crm::webhook_client::{AppointmentWebhookPayload, WebhookClient};

fn dialer(server: &MockServer) -> PlaybookClient {
    PlaybookClient::new(format!("{}/graphql", server.uri()), "dialer-key".to_string())
        .expect("client builds")
}

fn sample_payload() -> AppointmentWebhookPayload {
    let start = Utc.with_ymd_and_hms(2026, 10, 21, 6, 0, 0).unwrap();
    let details = AppointmentDetails {
        kind: SubjectKind::Lead,
        appointment: Appointment {
            id: Uuid::new_v4(),
            subject_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            status: AppointmentStatus::Upcoming,
            start_datetime: start,
            end_datetime: start + chrono::Duration::minutes(30),
            loan_status: None,
            notes: Some("Bring payslips".to_string()),
            created_by: Some("agent-7".to_string()),
            updated_by: Some("agent-7".to_string()),
            created_at: start,
            updated_at: start,
        },
        timeslot_ids: vec![Uuid::new_v4()],
    };

    AppointmentWebhookPayload::build(
        "appointment.created",
        &details,
        "Lim Wei Jie",
        Some("+60123456789"),
        Some("Nurul"),
        FixedOffset::east_opt(8 * 3600).unwrap(),
    )
}

#[tokio::test]
async fn test_dialer_start_playbook_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("x-api-key", "dialer-key"))
        .and(body_partial_json(json!({ "variables": { "id": "pb_42" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "startPlaybook": { "id": "pb_42", "name": "October renewals", "status": "RUNNING" } }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let playbook = dialer(&mock_server).start_playbook("pb_42").await.unwrap();
    assert_eq!(playbook.id, "pb_42");
    assert_eq!(playbook.status, "RUNNING");
}

#[tokio::test]
async fn test_dialer_create_contact_returns_external_id() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({
            "variables": { "input": { "playbookId": "pb_1", "phoneNumber": "+60123456789" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "createContact": { "id": "ct_9" } }
        })))
        .mount(&mock_server)
        .await;

    let id = dialer(&mock_server)
        .create_contact("pb_1", "Lim Wei Jie", "+60123456789")
        .await
        .unwrap();
    assert_eq!(id, "ct_9");
}

#[tokio::test]
async fn test_dialer_graphql_error_in_ok_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": null,
            "errors": [{ "message": "Playbook pb_404 not found" }]
        })))
        .mount(&mock_server)
        .await;

    let err = dialer(&mock_server).get_playbook("pb_404").await.unwrap_err();
    match err {
        AppError::ExternalApiError(message) => assert!(message.contains("pb_404 not found")),
        other => panic!("Unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_dialer_server_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
        .mount(&mock_server)
        .await;

    let err = dialer(&mock_server).stop_playbook("pb_1").await.unwrap_err();
    match err {
        AppError::ExternalApiError(message) => assert!(message.contains("500")),
        other => panic!("Unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_dialer_circuit_opens_after_repeated_failures() {
    let mock_server = MockServer::start().await;

    // Only three requests may reach the server; the fourth is rejected locally.
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = dialer(&mock_server);
    for _ in 0..3 {
        assert!(client.get_playbook("pb_1").await.is_err());
    }

    let err = client.get_playbook("pb_1").await.unwrap_err();
    assert!(err.to_string().contains("circuit open"));
}

#[tokio::test]
async fn test_dialer_delete_without_contacts_skips_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let deleted = dialer(&mock_server).delete_contacts("pb_1", &[]).await.unwrap();
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn test_webhook_delivery_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hooks/appointments"))
        .and(body_partial_json(json!({
            "event": "appointment.created",
            "客户姓名": "Lim Wei Jie",
            "预约时间": "14:00 - 14:30",
            "备注": "Bring payslips"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = WebhookClient::new(format!("{}/hooks/appointments", mock_server.uri())).unwrap();
    client.send(&sample_payload()).await.unwrap();
}

#[tokio::test]
async fn test_webhook_receiver_failure_is_reported() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hooks/appointments"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&mock_server)
        .await;

    let client = WebhookClient::new(format!("{}/hooks/appointments", mock_server.uri())).unwrap();
    let err = client.send(&sample_payload()).await.unwrap_err();
    assert!(matches!(err, AppError::ExternalApiError(_)));
}
