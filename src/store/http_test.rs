use super::*;
use crate::frame::ErrorCode;

#[test]
fn parse_string_data() {
    let stored = parse_load_body(r#"{"data":"{\"shape\":\"rect\"}","previewImage":"img"}"#)
        .unwrap()
        .expect("should be found");
    assert_eq!(stored.snapshot.as_str(), r#"{"shape":"rect"}"#);
    assert_eq!(stored.preview_image.as_deref(), Some("img"));
}

#[test]
fn parse_object_data_keeps_json_text() {
    let stored = parse_load_body(r#"{"data":{"shape":"circle"}}"#)
        .unwrap()
        .expect("should be found");
    assert_eq!(stored.snapshot.as_str(), r#"{"shape":"circle"}"#);
    assert!(stored.snapshot.is_structured());
    assert!(stored.preview_image.is_none());
}

#[test]
fn parse_null_or_missing_data_is_not_found() {
    assert!(parse_load_body(r#"{"data":null}"#).unwrap().is_none());
    assert!(parse_load_body(r#"{"name":"untitled"}"#).unwrap().is_none());
}

#[test]
fn parse_garbage_is_decode_error() {
    let err = parse_load_body("<html>oops</html>").unwrap_err();
    assert_eq!(err.error_code(), "E_PERSISTENCE_DECODE");
    assert!(!err.retryable());

    let err = parse_load_body("[1,2,3]").unwrap_err();
    assert!(matches!(err, StoreError::Decode(_)));
}

#[test]
fn board_ids_are_path_encoded() {
    let store = HttpStore::new("https://boards.example.test", 5).expect("client should build");
    assert_eq!(
        store.endpoint(&["api", "whiteboards", "abc123def456"]).as_str(),
        "https://boards.example.test/api/whiteboards/abc123def456"
    );
    assert_eq!(
        store.endpoint(&["api", "whiteboards", "a b/c"]).as_str(),
        "https://boards.example.test/api/whiteboards/a%20b%2Fc"
    );
}

#[test]
fn base_path_prefix_is_kept() {
    let store = HttpStore::new("https://host.test/tenant/", 5).expect("client should build");
    assert_eq!(
        store.endpoint(&["api", "whiteboards", "save"]).as_str(),
        "https://host.test/tenant/api/whiteboards/save"
    );
}

#[test]
fn malformed_base_url_is_rejected() {
    let err = HttpStore::new("not a url", 5).err().expect("should fail");
    assert_eq!(err.error_code(), "E_PERSISTENCE_CONFIG");
    assert!(!err.retryable());
}

#[test]
fn server_errors_are_retryable_client_errors_are_not() {
    assert!(StoreError::Status { status: 503 }.retryable());
    assert!(StoreError::Status { status: 429 }.retryable());
    assert!(!StoreError::Status { status: 400 }.retryable());
}

#[tokio::test]
async fn unreachable_api_surfaces_http_error() {
    let store = HttpStore::new("http://127.0.0.1:1", 1).expect("client should build");
    let err = store
        .save("board-1", &Snapshot::from("v1"), None)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "E_PERSISTENCE_HTTP");
    assert!(err.retryable());
}
