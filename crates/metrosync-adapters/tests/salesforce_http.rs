use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use metrosync_adapters::{CrmClient, RemoteError, SalesforceClient, SalesforceSession};
use metrosync_core::CrmPayload;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;

const OBJECT: &str = "Metro_Area__c";

#[derive(Clone, Default)]
struct Seen {
    queries: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<JsonValue>>>,
}

fn rejection(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!([{ "errorCode": code, "message": message }]))).into_response()
}

async fn query(State(seen): State<Seen>, Query(params): Query<HashMap<String, String>>) -> Response {
    let soql = params.get("q").cloned().unwrap_or_default();
    seen.queries.lock().unwrap().push(soql.clone());
    if soql.contains("Name = 'Austin'") {
        return Json(json!({
            "totalSize": 1,
            "done": true,
            "records": [{ "attributes": { "type": OBJECT }, "Id": "a01AUSTIN0000001" }]
        }))
        .into_response();
    }
    if soql.contains("Name = 'Broken'") {
        return rejection(StatusCode::BAD_REQUEST, "MALFORMED_QUERY", "unexpected token");
    }
    Json(json!({ "totalSize": 0, "done": true, "records": [] })).into_response()
}

async fn create(
    State(seen): State<Seen>,
    Path(object): Path<String>,
    Json(body): Json<JsonValue>,
) -> Response {
    seen.bodies.lock().unwrap().push(body.clone());
    if object != OBJECT {
        return rejection(StatusCode::NOT_FOUND, "NOT_FOUND", "The requested resource does not exist");
    }
    match body["Name"].as_str() {
        Some("Rejected") => rejection(
            StatusCode::BAD_REQUEST,
            "REQUIRED_FIELD_MISSING",
            "Required fields are missing: [Region__c]",
        ),
        Some("NoId") => Json(json!({ "success": true, "errors": [] })).into_response(),
        _ => (
            StatusCode::CREATED,
            Json(json!({ "id": "a01NEW0000000001", "success": true, "errors": [] })),
        )
            .into_response(),
    }
}

async fn update(
    State(seen): State<Seen>,
    Path((_object, id)): Path<(String, String)>,
    Json(body): Json<JsonValue>,
) -> Response {
    seen.bodies.lock().unwrap().push(body);
    if id == "a01AUSTIN0000001" {
        StatusCode::NO_CONTENT.into_response()
    } else {
        rejection(StatusCode::NOT_FOUND, "NOT_FOUND", "The requested resource does not exist")
    }
}

async fn serve() -> (SalesforceClient, Seen) {
    let seen = Seen::default();
    let app = Router::new()
        .route("/services/data/v59.0/query/", get(query))
        .route("/services/data/v59.0/sobjects/{object}/", post(create))
        .route("/services/data/v59.0/sobjects/{object}/{id}", patch(update))
        .with_state(seen.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (client(&format!("http://{addr}/")), seen)
}

fn client(instance_url: &str) -> SalesforceClient {
    SalesforceClient::new(
        reqwest::Client::new(),
        SalesforceSession {
            instance_url: instance_url.to_string(),
            access_token: "00Dtest".to_string(),
        },
        "59.0",
    )
}

fn payload(name: &str) -> CrmPayload {
    CrmPayload {
        name: name.to_string(),
        fields: BTreeMap::from([
            ("Active_Drivers__c".to_string(), 12),
            ("L90D_Itinerary__c".to_string(), 40),
        ]),
    }
}

#[tokio::test]
async fn find_returns_the_first_matching_id_or_none() {
    let (crm, seen) = serve().await;

    assert_eq!(
        crm.find(OBJECT, "Austin").await,
        Ok(Some("a01AUSTIN0000001".to_string()))
    );
    assert_eq!(crm.find(OBJECT, "Tulsa").await, Ok(None));
    assert_eq!(crm.find(OBJECT, "O'Hare").await, Ok(None));

    let queries = seen.queries.lock().unwrap().clone();
    assert_eq!(
        queries[0],
        "SELECT Id FROM Metro_Area__c WHERE Name = 'Austin' LIMIT 1"
    );
    assert_eq!(
        queries[2],
        "SELECT Id FROM Metro_Area__c WHERE Name = 'O\\'Hare' LIMIT 1"
    );
}

#[tokio::test]
async fn rejected_query_carries_the_provider_message() {
    let (crm, _) = serve().await;
    assert_eq!(
        crm.find(OBJECT, "Broken").await,
        Err(RemoteError::Rejected {
            status: 400,
            message: "MALFORMED_QUERY: unexpected token".to_string(),
        })
    );
}

#[tokio::test]
async fn create_posts_the_payload_and_returns_the_new_id() {
    let (crm, seen) = serve().await;
    let created = crm.create(OBJECT, &payload("Tulsa")).await.expect("create");

    assert_eq!(created.id, "a01NEW0000000001");
    assert_eq!(created.response["success"], true);
    let body = seen.bodies.lock().unwrap()[0].clone();
    assert_eq!(
        body,
        json!({ "Name": "Tulsa", "Active_Drivers__c": 12, "L90D_Itinerary__c": 40 })
    );
}

#[tokio::test]
async fn create_without_id_or_with_rejection_is_an_error() {
    let (crm, _) = serve().await;

    let err = crm.create(OBJECT, &payload("NoId")).await.expect_err("no id");
    assert!(matches!(err, RemoteError::Unexpected(ref m) if m.contains("create response without id")));

    let err = crm.create(OBJECT, &payload("Rejected")).await.expect_err("rejected");
    assert_eq!(
        err.to_string(),
        "REQUIRED_FIELD_MISSING: Required fields are missing: [Region__c] (http 400)"
    );
}

#[tokio::test]
async fn update_acknowledges_no_content_as_status() {
    let (crm, seen) = serve().await;
    let ack = crm
        .update(OBJECT, "a01AUSTIN0000001", &payload("Austin"))
        .await
        .expect("update");

    assert_eq!(ack, json!({ "status": 204 }));
    assert_eq!(seen.bodies.lock().unwrap()[0]["Name"], "Austin");

    let err = crm
        .update(OBJECT, "a01GONE", &payload("Austin"))
        .await
        .expect_err("missing record");
    assert!(matches!(err, RemoteError::Rejected { status: 404, .. }));
}

#[tokio::test]
async fn unreachable_instance_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let err = client(&format!("http://{addr}"))
        .find(OBJECT, "Austin")
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, RemoteError::Transport(_)));
}
