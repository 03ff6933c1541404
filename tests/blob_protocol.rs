//! Wire-protocol round trips: a RemoteStorage client against an
//! in-process server.

use std::sync::Arc;
use std::time::Duration;

use larch::build_app;
use larch::parse_config;
use larch::Loader;
use larch_core::storage::enumerate_all;
use larch_core::storage::fetch_bytes;
use larch_core::storage::has_blob;
use larch_core::storage::receive_bytes;
use larch_core::BlobRef;
use larch_core::Error;
use larch_core::SeekFetcher;
use larch_core::Storage;
use larch_core::StorageSeekFetcher;
use larch_routing::RemoteStorage;

async fn serve(config_json: &str, password: Option<&str>) -> String {
    let config = parse_config(config_json).expect("parse config");
    let mut loader = Loader::new(&config);
    loader.build_all().expect("build handlers");
    let app = build_app(&loader, password.map(str::to_string));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

const MEMORY_AT_BS: &str = r#"{
    "prefixes": {
        "/bs/": {"handler": "storage-memory"}
    }
}"#;

#[tokio::test]
async fn upload_fetch_stat_enumerate_remove() {
    let base = serve(MEMORY_AT_BS, None).await;
    let remote = RemoteStorage::new(format!("{base}/bs"), None);

    // Upload.
    let sb = receive_bytes(&remote, b"over the wire").await.expect("receive");
    assert_eq!(sb.size, 13);

    // Stat present + absent.
    assert!(has_blob(&remote, &sb.blob_ref).await.expect("stat"));
    let absent = BlobRef::sha1_from_bytes(b"never uploaded");
    assert!(!has_blob(&remote, &absent).await.expect("stat"));

    // Fetch bytes and 404 mapping.
    let data = fetch_bytes(&remote, &sb.blob_ref).await.expect("fetch");
    assert_eq!(&data[..], b"over the wire");
    assert!(matches!(
        fetch_bytes(&remote, &absent).await,
        Err(Error::NotFound)
    ));

    // Enumerate pages in order.
    let mut want = vec![sb.blob_ref.to_string()];
    for i in 0..7u32 {
        let sb = receive_bytes(&remote, format!("wire blob {i}").as_bytes())
            .await
            .expect("receive");
        want.push(sb.blob_ref.to_string());
    }
    want.sort();
    let got: Vec<String> = enumerate_all(&remote, 3)
        .await
        .expect("enumerate")
        .into_iter()
        .map(|sb| sb.blob_ref.to_string())
        .collect();
    assert_eq!(got, want);

    // Remove.
    remote.remove(std::slice::from_ref(&sb.blob_ref)).await.expect("remove");
    assert!(!has_blob(&remote, &sb.blob_ref).await.expect("stat"));
}

#[tokio::test]
async fn upload_is_idempotent_over_the_wire() {
    let base = serve(MEMORY_AT_BS, None).await;
    let remote = RemoteStorage::new(format!("{base}/bs"), None);
    let first = receive_bytes(&remote, b"same bytes").await.expect("first");
    let second = receive_bytes(&remote, b"same bytes").await.expect("second");
    assert_eq!(first, second);
}

#[tokio::test]
async fn shared_secret_is_enforced() {
    let base = serve(MEMORY_AT_BS, Some("sesame")).await;

    // Without the password the protocol returns 401.
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{base}/bs/camli/enumerate-blobs"))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    // The remote client with the secret works.
    let authed = RemoteStorage::new(format!("{base}/bs"), Some("sesame".to_string()));
    let sb = receive_bytes(&authed, b"let me in").await.expect("receive");
    assert!(has_blob(&authed, &sb.blob_ref).await.expect("stat"));

    // A wrong password is rejected as transient (HTTP 401 surfaced).
    let wrong = RemoteStorage::new(format!("{base}/bs"), Some("bogus".to_string()));
    assert!(receive_bytes(&wrong, b"denied").await.is_err());
}

#[tokio::test]
async fn mismatched_upload_is_a_bad_request() {
    let base = serve(MEMORY_AT_BS, None).await;
    let client = reqwest::Client::new();

    // Field named by one ref, bytes of another.
    let lie = BlobRef::sha1_from_bytes(b"what I claim to be");
    let part = reqwest::multipart::Part::bytes(b"what I actually am".to_vec())
        .file_name(lie.to_string());
    let form = reqwest::multipart::Form::new().part(lie.to_string(), part);
    let resp = client
        .post(format!("{base}/bs/camli/upload"))
        .multipart(form)
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["errorType"], "input");
}

#[tokio::test]
async fn file_write_and_read_through_the_wire() {
    let base = serve(MEMORY_AT_BS, None).await;
    let remote: Arc<dyn Storage> = Arc::new(RemoteStorage::new(format!("{base}/bs"), None));

    // Deterministic bytes, larger than a few chunks.
    let mut data = Vec::with_capacity(150_000);
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    while data.len() < 150_000 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        data.extend_from_slice(&state.to_le_bytes());
    }
    data.truncate(150_000);

    let root = larch_schema::write_file_from_reader_rolling(remote.clone(), "wired.bin", &data[..])
        .await
        .expect("write");

    let fetcher: Arc<dyn SeekFetcher> = Arc::new(StorageSeekFetcher::new(remote));
    let mut reader = larch_schema::FileReader::new(fetcher, &root).await.expect("reader");
    assert_eq!(reader.read_all().await.expect("read"), data);
}

#[tokio::test]
async fn search_endpoints_answer_from_the_index() {
    let config = r#"{
        "prefixes": {
            "/bs/": {"handler": "storage-memory"},
            "/index/": {"handler": "storage-sqlite-index"},
            "/root/": {
                "handler": "storage-replica",
                "handlerArgs": {"backends": ["/bs/", "/index/"]}
            },
            "/search/": {
                "handler": "search",
                "handlerArgs": {
                    "index": "/index/",
                    "owner": "sha1-0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33"
                }
            }
        }
    }"#;
    let base = serve(config, None).await;
    let owner = BlobRef::must_parse("sha1-0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33");
    let remote = RemoteStorage::new(format!("{base}/root"), None);

    // A permanode and a signed claim on it, uploaded over the wire.
    let permanode = larch_schema::Schema::unsigned_permanode();
    let pn_json = larch_schema::to_camli_json(&permanode).expect("json");
    let pn_ref = receive_bytes(&remote, pn_json.as_bytes()).await.expect("receive").blob_ref;

    let date = chrono::DateTime::parse_from_rfc3339("2024-02-03T04:05:06Z")
        .expect("date")
        .with_timezone(&chrono::Utc);
    let mut claim = larch_schema::Schema::set_attribute_claim(pn_ref.clone(), "title", "wired", date);
    claim.signer = Some(owner.clone());
    claim.sig = Some("sig".to_string());
    let claim_json = larch_schema::to_camli_json(&claim).expect("json");
    receive_bytes(&remote, claim_json.as_bytes()).await.expect("receive claim");

    let client = reqwest::Client::new();
    let claims: serde_json::Value = client
        .get(format!("{base}/search/camli/search/claims"))
        .query(&[("permanode", pn_ref.to_string())])
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    let list = claims["claims"].as_array().expect("claims array");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["type"], "set-attribute");
    assert_eq!(list[0]["attr"], "title");
    assert_eq!(list[0]["value"], "wired");
    assert_eq!(list[0]["date"], "2024-02-03T04:05:06Z");

    let described: serde_json::Value = client
        .get(format!("{base}/search/camli/search/describe"))
        .query(&[("blobref", pn_ref.to_string())])
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    let entry = &described[pn_ref.to_string()];
    assert_eq!(entry["camliType"], "permanode");
    assert_eq!(entry["permanode"]["attr"]["title"][0], "wired");

    let recent: serde_json::Value = client
        .get(format!("{base}/search/camli/search/recent"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    let recent_list = recent["recent"].as_array().expect("recent array");
    assert_eq!(recent_list.len(), 1);
    assert_eq!(recent_list[0]["blobref"], pn_ref.to_string());
}

#[tokio::test]
async fn stat_long_poll_over_the_wire() {
    let base = serve(MEMORY_AT_BS, None).await;
    let remote = Arc::new(RemoteStorage::new(format!("{base}/bs"), None));

    let br = BlobRef::sha1_from_bytes(b"arrives later");
    let writer = remote.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        receive_bytes(writer.as_ref(), b"arrives later").await.expect("receive");
    });

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    remote
        .stat(tx, std::slice::from_ref(&br), Duration::from_secs(5))
        .await
        .expect("stat");
    assert_eq!(rx.recv().await.map(|sb| sb.blob_ref), Some(br));
    handle.await.expect("writer");
}
