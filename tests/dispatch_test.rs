use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;

use engine_pipe::config;
use engine_pipe::dispatch::types::{WireRequest, WireResponse};
use engine_pipe::dispatch::{
    CallEnvelope, Command, CommandRegistry, ConnectionPool, DispatchError, Dispatcher, Marshaller,
    Platform, Status, TransportFailure, TypedPayload, UnityEditor, WireType,
};

/// In-process stand-in for the editor's RPC endpoint.
struct FakeEngine {
    address: String,
    accepted: Arc<AtomicUsize>,
    runtime: Option<Runtime>,
}

impl FakeEngine {
    fn start() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        runtime.spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream));
            }
        });

        Self {
            address,
            accepted,
            runtime: Some(runtime),
        }
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Answers each request on its own task so a slow method does not block the rest.
async fn serve(stream: TcpStream) {
    let (read_half, mut writer) = stream.into_split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request: WireRequest = serde_json::from_str(&line).unwrap();
        let tx = tx.clone();
        tokio::spawn(async move {
            let (status, payload) = answer(&request).await;
            let response = WireResponse {
                id: request.id,
                status,
                payload,
            };
            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            let _ = tx.send(out);
        });
    }
}

async fn answer(request: &WireRequest) -> (Status, TypedPayload) {
    let args = Marshaller::decode_params(&request.params).unwrap();
    match request.method.as_str() {
        "UGrpc.SystemUtils.GetProjectInfo" => (
            Status::ok(),
            Marshaller::encode(&json!({"project_root": "/work/demo", "project_name": "demo"})),
        ),
        "UnityEditor.AssetDatabase.FindAssets" => (
            Status::ok(),
            TypedPayload::new(
                WireType::StringArray.type_url(),
                json!({"values": ["guid-1", "guid-2"]}),
            ),
        ),
        "UnityEditor.AssetDatabase.GUIDToAssetPath" => {
            let guid = args.first().and_then(Value::as_str).unwrap_or_default();
            (Status::ok(), Marshaller::encode(&json!(format!("Assets/{guid}.fbx"))))
        }
        "UnityEditor.AssetDatabase.Refresh" => {
            tokio::time::sleep(Duration::from_millis(5)).await;
            (Status::ok(), TypedPayload::empty())
        }
        "UGrpc.PrefabUtils.SetValue" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            (Status::ok(), TypedPayload::empty())
        }
        other => (
            Status::failed(5, format!("method not found: {other}")),
            Marshaller::encode(&json!({"method": other})),
        ),
    }
}

fn dispatcher_for(address: &str) -> Dispatcher {
    let pool = Arc::new(ConnectionPool::tcp().unwrap());
    Dispatcher::new(
        Arc::new(CommandRegistry::builtin()),
        pool,
        Platform::Unity,
        address,
    )
    .with_default_timeout(Duration::from_secs(5))
}

/// An address nothing is listening on.
fn dead_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

// ── Scenarios ─────────────────────────────────────────────────────

#[test]
fn find_assets_decodes_string_array() {
    let engine = FakeEngine::start();
    let dispatcher = dispatcher_for(&engine.address);

    let resp = dispatcher
        .dispatch(
            Command::UnityEditorAssetdatabaseFindAssets,
            vec![json!("t:Model"), json!(["Assets/Models"])],
            None,
            None,
        )
        .unwrap();

    assert_eq!(resp.method, "UnityEditor.AssetDatabase.FindAssets");
    assert!(resp.is_success());
    assert_eq!(resp.payload, json!(["guid-1", "guid-2"]));
}

#[test]
fn unreachable_address_fails_and_leaves_no_usable_channel() {
    let address = dead_address();
    let dispatcher = dispatcher_for(&address);

    let err = dispatcher
        .dispatch(Command::SystemGetProjectinfo, vec![], None, None)
        .unwrap_err();

    assert_eq!(err.transport_failure(), Some(TransportFailure::Connect));
    assert!(err.is_retryable());
    assert!(!dispatcher.pool().contains_usable(&address));
}

#[test]
fn two_threads_share_one_connection() {
    let engine = FakeEngine::start();
    let dispatcher = dispatcher_for(&engine.address);
    let completed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            let completed = Arc::clone(&completed);
            std::thread::spawn(move || {
                for _ in 0..5 {
                    let resp = dispatcher
                        .dispatch(Command::UnityEditorAssetdatabaseRefresh, vec![], None, None)
                        .unwrap();
                    assert!(resp.is_success());
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(completed.load(Ordering::SeqCst), 10);
    assert_eq!(dispatcher.pool().channel_count(), 1);
    assert_eq!(dispatcher.pool().opened_count(), 1);
    assert_eq!(engine.accepted(), 1);
}

#[test]
fn application_failure_is_returned_as_data() {
    let engine = FakeEngine::start();
    let dispatcher = dispatcher_for(&engine.address);

    let resp = dispatcher
        .dispatch(Command::UnityPrefabMerge, vec![json!("Assets/a.prefab")], None, None)
        .unwrap();

    assert!(!resp.is_success());
    assert_eq!(resp.status.code, 5);
    assert_eq!(resp.payload, json!({"method": "UGrpc.PrefabUtils.Merge"}));
    assert!(matches!(
        resp.into_payload(),
        Err(DispatchError::Application { code: 5, .. })
    ));
    assert!(dispatcher.pool().contains_usable(&engine.address));
}

#[test]
fn unsupported_command_fails_before_connecting() {
    let engine = FakeEngine::start();
    let dispatcher = dispatcher_for(&engine.address);

    let err = dispatcher
        .dispatch(Command::SceneClone, vec![], Some(Platform::Unreal), None)
        .unwrap_err();

    assert!(matches!(err, DispatchError::UnsupportedCommand { .. }));
    assert!(!err.is_retryable());
    assert_eq!(dispatcher.pool().opened_count(), 0);
    assert_eq!(engine.accepted(), 0);
}

#[test]
fn slow_call_times_out_but_channel_survives() {
    let engine = FakeEngine::start();
    let dispatcher = dispatcher_for(&engine.address);

    let err = dispatcher
        .call(
            CallEnvelope::new(Command::UnityPrefabSetValue)
                .with_timeout(Duration::from_millis(50)),
        )
        .unwrap_err();
    assert_eq!(err.transport_failure(), Some(TransportFailure::Timeout));

    // The late response is discarded; the same connection keeps serving.
    let resp = dispatcher
        .dispatch(Command::UnityEditorAssetdatabaseRefresh, vec![], None, None)
        .unwrap();
    assert!(resp.is_success());
    assert_eq!(engine.accepted(), 1);
}

#[test]
fn unity_facade_resolves_asset_paths() {
    let engine = FakeEngine::start();
    let unity = UnityEditor::new(dispatcher_for(&engine.address));

    let info = unity.project_info().unwrap();
    assert_eq!(info.project_name.as_deref(), Some("demo"));

    let paths = unity.find_assets("t:Model", &["Assets/Models"]).unwrap();
    assert_eq!(paths, vec!["Assets/guid-1.fbx", "Assets/guid-2.fbx"]);
}

#[tokio::test]
async fn async_dispatch_from_inside_a_runtime() {
    let engine = tokio::task::spawn_blocking(FakeEngine::start).await.unwrap();
    let dispatcher = dispatcher_for(&engine.address);

    let resp = dispatcher
        .dispatch_async(Command::UnityEditorAssetdatabaseGuidToPath, vec![json!("abc")], None, None)
        .await
        .unwrap();
    assert_eq!(resp.payload, json!("Assets/abc.fbx"));

    // Runtimes must not be dropped from async code.
    let pool = Arc::clone(dispatcher.pool());
    drop(dispatcher);
    tokio::task::spawn_blocking(move || {
        drop(pool);
        drop(engine);
    })
    .await
    .unwrap();
}

#[test]
fn config_file_drives_dispatcher_address() {
    let engine = FakeEngine::start();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(config::CONFIG_FILE_NAME);
    std::fs::write(
        &path,
        format!(
            "default_platform: unity\ncall_timeout_ms: 2000\nendpoints:\n  default: \"{}\"\n",
            engine.address
        ),
    )
    .unwrap();

    let config = config::load_config(&path).unwrap();
    let dispatcher = Dispatcher::new(
        Arc::new(CommandRegistry::builtin()),
        Arc::new(ConnectionPool::tcp().unwrap()),
        config.default_platform,
        config.endpoints.default.clone().unwrap(),
    )
    .with_default_timeout(config.call_timeout());

    let resp = dispatcher
        .dispatch(Command::SystemGetProjectinfo, vec![], None, None)
        .unwrap();
    assert_eq!(resp.payload["project_root"], "/work/demo");
}
