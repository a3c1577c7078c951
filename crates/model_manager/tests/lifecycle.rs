//! Полный цикл на настоящем `model.json`: файлы с диска и локальный HTTP-сервер.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use model_manager::{InputSpec, LoadOutcome, LoadPhase, ModelConfig, ModelSession, PhaseEvent};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const CONV_KERNEL: [usize; 4] = [3, 3, 3, 4];
const DENSE_KERNEL: [usize; 2] = [26 * 22 * 4, 3];

fn pseudo_weights(count: usize, salt: usize) -> Vec<f32> {
    (0..count)
        .map(|i| (((i + salt) % 7) as f32 - 3.0) * 0.01)
        .collect()
}

/// Conv2D(4, 3x3, relu) → MaxPooling2D(2) → Flatten → Dense(3, softmax) под вход [1, 55, 47, 3].
fn write_web_model(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("model_manager_it_{}_{}", std::process::id(), name));
    let dir = root.join("web_model");
    std::fs::create_dir_all(&dir).expect("temp dir");

    let descriptor = json!({
        "format": "layers-model",
        "generatedBy": "keras v2.11.0",
        "convertedBy": "TensorFlow.js Converter v4.2.0",
        "modelTopology": {
            "class_name": "Sequential",
            "config": {"name": "face_net", "layers": [
                {"class_name": "Conv2D", "config": {
                    "name": "conv", "batch_input_shape": [null, 55, 47, 3], "filters": 4,
                    "kernel_size": [3, 3], "strides": [1, 1], "padding": "valid", "activation": "relu"
                }},
                {"class_name": "MaxPooling2D", "config": {"name": "pool", "pool_size": [2, 2]}},
                {"class_name": "Flatten", "config": {"name": "flatten"}},
                {"class_name": "Dense", "config": {"name": "dense", "units": 3, "activation": "softmax"}}
            ]}
        },
        "weightsManifest": [{
            "paths": ["group1-shard1of1.bin"],
            "weights": [
                {"name": "conv/kernel", "shape": CONV_KERNEL, "dtype": "float32"},
                {"name": "conv/bias", "shape": [4], "dtype": "float32"},
                {"name": "dense/kernel", "shape": DENSE_KERNEL, "dtype": "float32"},
                {"name": "dense/bias", "shape": [3], "dtype": "float32"}
            ]
        }]
    });

    let mut values = pseudo_weights(CONV_KERNEL.iter().product(), 0);
    values.extend([0.1, 0.0, -0.1, 0.05]);
    values.extend(pseudo_weights(DENSE_KERNEL.iter().product(), 3));
    values.extend([0.0, 0.1, -0.1]);
    let shard: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

    std::fs::write(dir.join("model.json"), serde_json::to_vec(&descriptor).expect("json")).expect("write model.json");
    std::fs::write(dir.join("group1-shard1of1.bin"), shard).expect("write shard");
    root
}

fn record(session: &ModelSession) -> Arc<Mutex<Vec<LoadPhase>>> {
    let phases = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&phases);
    session.subscribe(Arc::new(move |e: &PhaseEvent| {
        sink.lock().expect("phases lock").push(e.phase());
    }));
    phases
}

#[tokio::test]
async fn web_model_loads_and_predicts() {
    let root = write_web_model("ok");
    let config = ModelConfig {
        asset_root: root.clone(),
        ..ModelConfig::default()
    };
    let session = ModelSession::from_config(config, InputSpec::random_normal(Some(42))).expect("valid config");
    let phases = record(&session);
    assert_eq!(session.phase(), LoadPhase::Idle);

    let outcome = session.load().await;
    assert!(outcome.is_ready(), "{outcome:?} / {:?}", session.error_message());
    assert_eq!(*phases.lock().expect("phases lock"), vec![LoadPhase::Loading, LoadPhase::Ready]);
    let weights = session.memory();
    assert_eq!(weights.num_tensors, 4);

    let result = session.run().await.expect("prediction");
    assert_eq!(result.len(), 3);
    let total: f32 = result.values().iter().sum();
    assert!((total - 1.0).abs() < 1e-4, "softmax row sums to {total}");

    let same = session.run().await.expect("prediction");
    assert_eq!(same, result);
    assert_eq!(session.memory().num_tensors, weights.num_tensors);

    session.dispose().await;
    assert_eq!(session.phase(), LoadPhase::Idle);
    assert_eq!(session.memory().num_tensors, 0);

    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test]
async fn wrong_input_shape_is_a_load_failure() {
    let root = write_web_model("shape");
    let config = ModelConfig {
        asset_root: root.clone(),
        input_shape: vec![1, 28, 28, 1],
        ..ModelConfig::default()
    };
    let session = ModelSession::from_config(config, InputSpec::default()).expect("valid config");

    let outcome = session.load().await;
    assert!(matches!(outcome, LoadOutcome::Failed { .. }));
    let message = session.error_message().expect("message");
    assert!(message.starts_with("Model failed to load: "), "{message}");
    assert_eq!(session.memory().num_tensors, 0);

    let _ = std::fs::remove_dir_all(root);
}

#[tokio::test]
async fn values_of_wrong_length_give_empty_result() {
    let root = write_web_model("values");
    let config = ModelConfig {
        asset_root: root.clone(),
        ..ModelConfig::default()
    };
    let session = ModelSession::from_config(config, InputSpec::default()).expect("valid config");
    assert!(session.load().await.is_ready());

    let memory = session.memory();
    let result = session
        .run_with(&InputSpec::values(vec![0.5; 10]))
        .await
        .expect("wrong length is tolerated");
    assert!(result.is_empty());
    assert_eq!(session.phase(), LoadPhase::Ready);
    assert_eq!(session.memory().num_tensors, memory.num_tensors);

    let _ = std::fs::remove_dir_all(root);
}

/// Отдаёт `response` на любой запрос и закрывает соединение.
async fn serve(response: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response).await;
            let _ = stream.shutdown().await;
        }
    });
    format!("http://{addr}/web_model/model.json")
}

#[tokio::test]
async fn http_404_fails_the_load() {
    let url = serve(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
    let config = ModelConfig {
        model_url: url.clone(),
        http_timeout_secs: 5,
        ..ModelConfig::default()
    };
    let session = ModelSession::from_config(config, InputSpec::default()).expect("valid config");
    let phases = record(&session);

    let outcome = session.load().await;
    let LoadOutcome::Failed { message, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.starts_with("Model failed to load: "));
    assert!(message.contains("404"), "{message}");
    assert_eq!(*phases.lock().expect("phases lock"), vec![LoadPhase::Loading, LoadPhase::Failed]);
    assert!(session.manager().borrow_ready().await.is_err());
    assert!(session.run().await.is_none());
    assert_eq!(session.status().source.as_deref(), Some(url.as_str()));
}

#[tokio::test]
async fn huge_content_length_fails_the_load() {
    let url = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 100000000000000\r\nConnection: close\r\n\r\n{}").await;
    let config = ModelConfig {
        model_url: url,
        http_timeout_secs: 5,
        ..ModelConfig::default()
    };
    let session = ModelSession::from_config(config, InputSpec::default()).expect("valid config");
    let phases = record(&session);

    let outcome = session.load().await;
    assert!(matches!(outcome, LoadOutcome::Failed { .. }), "{outcome:?}");
    assert_eq!(session.phase(), LoadPhase::Failed);
    assert_eq!(*phases.lock().expect("phases lock"), vec![LoadPhase::Loading, LoadPhase::Failed]);
    assert_eq!(session.memory().num_tensors, 0);
}
