//! Config and status reconciliation against a scripted control plane

mod common;

use common::{config_fetch, Harness, Reply, BAND, OTHER};
use mudband_common::Error;
use mudband_core::control::ConfigFetch;
use mudband_core::{ConfigRefresh, NativeCorePort, StatusRefresh};
use serde_json::json;

fn status_doc(band_uuid: &str, mfa: bool) -> serde_json::Value {
    json!({
        "band_uuid": band_uuid,
        "status": {
            "mfa_authentication_required": mfa,
            "mfa_authentication_url": if mfa { "https://sso.example/mfa" } else { "" }
        },
        "peers": [
            {"iface_addr": "100.64.0.2", "endpoint_ip": "203.0.113.7", "endpoint_port": 51820, "endpoint_t_heartbeated": 1700000000},
            {"iface_addr": "100.64.0.2", "endpoint_ip": "203.0.113.8", "endpoint_port": 51820, "endpoint_t_heartbeated": 1600000000}
        ]
    })
}

#[tokio::test]
async fn test_refresh_unchanged_only_for_same_token() {
    let h = Harness::enrolled().await;
    let reconciler = h.core.reconciler();
    assert_eq!(reconciler.validation_token().as_deref(), Some("v1"));

    let refresh = reconciler.refresh_config(Some("v1")).await.unwrap();
    assert!(matches!(refresh, ConfigRefresh::Unchanged));

    let refresh = reconciler.refresh_config(Some("W/v1")).await.unwrap();
    assert!(matches!(refresh, ConfigRefresh::Unchanged));

    *h.control.config.lock() = Reply::Ok(config_fetch(
        "v2",
        json!([
            {"name": "dev1", "private_ip": "100.64.0.2", "wireguard_pubkey": "pk1"},
            {"name": "dev2", "private_ip": "100.64.0.3", "wireguard_pubkey": "pk2"}
        ]),
    ));
    let refresh = reconciler.refresh_config(Some("v1")).await.unwrap();
    match refresh {
        ConfigRefresh::Updated(config) => {
            assert_eq!(config.validation_token.as_deref(), Some("v2"));
            assert_eq!(config.peers.len(), 2);
        }
        ConfigRefresh::Unchanged => panic!("new token must update"),
    }
    assert_eq!(reconciler.devices().len(), 2);
    assert_eq!(h.core.port().band_config_etag().as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_not_modified_keeps_config() {
    let h = Harness::enrolled().await;
    let before = h.core.reconciler().config().unwrap();

    *h.control.config.lock() = Reply::Ok(ConfigFetch::NotModified);
    let refresh = h.core.reconciler().refresh_config(Some("v1")).await.unwrap();

    assert!(matches!(refresh, ConfigRefresh::Unchanged));
    assert_eq!(h.core.reconciler().config().unwrap(), before);
    assert_eq!(
        h.control.config_tokens.lock().last().cloned().flatten().as_deref(),
        Some("v1")
    );
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_snapshot() {
    let h = Harness::enrolled().await;
    let version = h.core.reconciler().version();
    let devices = h.core.reconciler().devices();

    *h.control.config.lock() = Reply::Network;
    let err = h.core.reconciler().refresh_config(None).await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));

    *h.control.config.lock() = Reply::Ok(ConfigFetch::Fetched {
        validation_token: Some("v9".into()),
        body: "{not json".into(),
    });
    let err = h.core.reconciler().refresh_config(None).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));

    assert_eq!(h.core.reconciler().version(), version);
    assert_eq!(h.core.reconciler().devices(), devices);
    assert_eq!(h.core.reconciler().validation_token().as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_device_heartbeats_from_status() {
    let h = Harness::enrolled().await;

    let devices = h.core.reconciler().devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name, "dev1");
    assert_eq!(devices[0].heartbeat_time, 0);

    h.write_status(status_doc(BAND, false));
    let refresh = h.core.reconciler().refresh_status().await.unwrap();
    assert!(matches!(refresh, StatusRefresh::Updated(_)));

    // Duplicate addresses resolve to the first status peer.
    let devices = h.core.reconciler().devices();
    assert_eq!(devices[0].heartbeat_time, 1700000000);
    assert!(!h.core.reconciler().mfa_state().required);
}

#[tokio::test]
async fn test_status_for_other_band_is_ignored() {
    let h = Harness::enrolled().await;
    h.write_status(status_doc(OTHER, true));

    let refresh = h.core.reconciler().refresh_status().await.unwrap();
    assert!(matches!(refresh, StatusRefresh::Absent));
    assert!(!h.core.reconciler().mfa_state().required);
    assert_eq!(h.core.reconciler().devices()[0].heartbeat_time, 0);
}

#[tokio::test]
async fn test_missing_status_is_not_an_error() {
    let h = Harness::enrolled().await;
    let refresh = h.core.reconciler().refresh_status().await.unwrap();
    assert!(matches!(refresh, StatusRefresh::Absent));
}

#[tokio::test]
async fn test_mfa_state_from_status() {
    let h = Harness::enrolled().await;
    h.write_status(status_doc(BAND, true));
    h.core.refresh().await.unwrap();

    let mfa = h.core.snapshot().mfa.clone();
    assert!(mfa.required);
    assert_eq!(mfa.url, "https://sso.example/mfa");
}

#[tokio::test]
async fn test_config_mfa_challenge_is_remembered() {
    let h = Harness::enrolled().await;
    *h.control.config.lock() = Reply::Ok(ConfigFetch::Fetched {
        validation_token: Some("v2".into()),
        body: json!({"status": 301, "sso_url": "https://sso.example/login"}).to_string(),
    });

    let err = h.core.refresh().await.unwrap_err();
    assert!(matches!(err, Error::MfaRequired { .. }));
    assert_eq!(
        h.core.snapshot().enrollment.pending_mfa_url.as_deref(),
        Some("https://sso.example/login")
    );

    // A later successful fetch clears the challenge.
    *h.control.config.lock() = Reply::Ok(config_fetch("v3", common::default_peers()));
    h.core.refresh().await.unwrap();
    assert!(h.core.snapshot().enrollment.pending_mfa_url.is_none());
}

#[tokio::test]
async fn test_refresh_without_enrollment() {
    let h = Harness::new().await;
    let err = h.core.reconciler().refresh_config(None).await.unwrap_err();
    assert!(matches!(err, Error::State(_)));
    assert_eq!(h.control.count("fetch_config"), 0);
}

#[tokio::test]
async fn test_cached_config_survives_restart() {
    let h = Harness::enrolled().await;
    let root = h.dir.path().to_path_buf();

    let mut config = mudband_core::CoreConfig::default();
    config.root_dir = root;
    let port = std::sync::Arc::new(mudband_core::LocalCorePort::new(&config));
    let reopened = mudband_core::Core::open(
        config,
        port,
        std::sync::Arc::new(common::FakeControl::new()),
        std::sync::Arc::new(common::FakePlatform::new()),
    )
    .await
    .unwrap();

    assert!(reopened.enrollment().is_enrolled());
    assert_eq!(reopened.reconciler().validation_token().as_deref(), Some("v1"));
    assert_eq!(reopened.snapshot().devices.len(), 1);
}
