use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use facerelay_core::envelope::Mapping;
use facerelay_core::numeric::{DType, NumericArray};
use facerelay_core::{encode, ErrorKind, HttpTransport, Relay, RelayOptions, Value};
use std::time::Duration;
use tokio::net::TcpListener;

async fn spawn_backend(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/")
}

fn relay_to(url: &str, timeout: Duration) -> Relay<HttpTransport> {
    let transport = HttpTransport::new(url, timeout).unwrap();
    Relay::new(
        transport,
        RelayOptions {
            timeout,
            ..RelayOptions::default()
        },
    )
}

fn face(image_len: usize) -> Value {
    let mut fields = Mapping::new();
    fields.insert(
        "bbox".into(),
        NumericArray::from_vec(DType::Float32, &[4], vec![10.0, 20.0, image_len as f64, 80.0])
            .unwrap()
            .into(),
    );
    fields.insert(
        "kps".into(),
        NumericArray::from_vec(DType::Float32, &[5, 2], (0..10).map(f64::from).collect())
            .unwrap()
            .into(),
    );
    fields.insert(
        "embedding".into(),
        NumericArray::from_vec(DType::Float32, &[512], vec![0.0442; 512])
            .unwrap()
            .into(),
    );
    fields.insert("det_score".into(), Value::Float(0.8125));
    Value::Object {
        class: "insightface.app.common.Face".into(),
        fields,
    }
}

/// Stands in for the face server: the body is a JSON string holding
/// jsonpickle text with the image under `image`.
async fn face_server(body: String) -> (StatusCode, String) {
    let Ok(envelope) = serde_json::from_str::<String>(&body) else {
        return (StatusCode::BAD_REQUEST, "expected a JSON string body".into());
    };
    let Ok(request) = facerelay_core::decode(&envelope) else {
        return (StatusCode::BAD_REQUEST, "bad envelope".into());
    };
    let Some(image) = request.get("image").and_then(Value::as_bytes) else {
        return (StatusCode::BAD_REQUEST, "no image".into());
    };

    let mut reply = Mapping::new();
    reply.insert(
        "face_detection_recognition".into(),
        Value::Seq(vec![face(image.len())]),
    );
    (StatusCode::OK, encode(&Value::Map(reply)).unwrap())
}

#[tokio::test]
async fn relays_image_through_http_backend() {
    let url = spawn_backend(Router::new().route("/", post(face_server))).await;
    let relay = relay_to(&url, Duration::from_secs(5));

    let faces = relay.relay(vec![7u8; 300]).await.unwrap();

    assert_eq!(faces.len(), 1);
    assert_eq!(faces[0].bbox, [10.0, 20.0, 300.0, 80.0]);
    assert_eq!(faces[0].det_score, 0.8125);
    assert_eq!(faces[0].landmark[4], [8.0, 9.0]);
    assert_eq!(faces[0].embedding.len(), 512);
    assert!((faces[0].embedding[0] - 0.0442).abs() < 1e-6);
}

#[tokio::test]
async fn slow_backend_times_out() {
    let router = Router::new().route(
        "/",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "{}"
        }),
    );
    let url = spawn_backend(router).await;
    let relay = relay_to(&url, Duration::from_millis(200));

    let err = relay.relay(vec![1, 2, 3]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendTimeout);
}

#[tokio::test]
async fn backend_error_status_is_rejected() {
    let router = Router::new().route(
        "/",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model crashed") }),
    );
    let url = spawn_backend(router).await;
    let relay = relay_to(&url, Duration::from_secs(5));

    let err = relay.relay(vec![1]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendRejected);
    assert!(err.message.contains("model crashed"));
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let relay = relay_to(&format!("http://{addr}/"), Duration::from_secs(5));
    let err = relay.relay(vec![1]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendUnreachable);
}

#[tokio::test]
async fn missing_result_key_means_no_faces() {
    let router = Router::new().route("/", post(|| async { r#"{"py/object": "app.Reply"}"# }));
    let url = spawn_backend(router).await;
    let relay = relay_to(&url, Duration::from_secs(5));

    assert!(relay.relay(vec![1]).await.unwrap().is_empty());
}
