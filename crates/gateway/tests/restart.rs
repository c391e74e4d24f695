use std::{sync::Arc, time::Duration};

use {
    tokio::sync::mpsc,
    wagate_channels::{ClientFactory, DeviceStore},
    wagate_config::WagateConfig,
    wagate_gateway::{
        GatewayState, open_metadata,
        pairing::{PairingPhase, run_pairing},
        registry::CreateSession,
    },
    wagate_whatsapp::{LoopbackFactory, MemoryDeviceStore},
};

use common::{fast_pairing, test_config};

mod common;

async fn boot(config: &WagateConfig, store: &Arc<MemoryDeviceStore>) -> Arc<GatewayState> {
    let metadata = open_metadata(config).await.unwrap();
    let factory: Arc<dyn ClientFactory> = Arc::new(LoopbackFactory::new(
        Arc::clone(store) as Arc<dyn DeviceStore>,
        fast_pairing(),
    ));
    GatewayState::new(config.clone(), factory, metadata).unwrap()
}

#[tokio::test]
async fn sessions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.database.path = Some(dir.path().join("data").join("wagate.db"));
    let store = Arc::new(MemoryDeviceStore::new());

    let phone = {
        let state = boot(&config, &store).await;
        let registry = &state.registry;
        registry
            .create(CreateSession {
                id: Some("9999999999".into()),
                name: "Sales".into(),
                ..CreateSession::default()
            })
            .await
            .unwrap();
        registry
            .create(CreateSession {
                id: Some("12345".into()),
                ..CreateSession::default()
            })
            .await
            .unwrap();

        let guard = registry.begin_pairing("9999999999").unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let phase = run_pairing(registry.clone(), guard, tx, Duration::from_secs(10)).await;
        assert_eq!(phase, PairingPhase::Succeeded);

        let phone = registry.get("9999999999").unwrap().actual_phone.unwrap();
        registry.shutdown().await;
        phone
    };
    assert!(dir.path().join("data").join("wagate.db").exists());

    let state = boot(&config, &store).await;
    let restored = state.registry.restore_all().await.unwrap();
    assert_eq!(restored.len(), 2);

    let paired = state.registry.get("9999999999").unwrap();
    assert_eq!(paired.name, "Sales");
    assert_eq!(paired.actual_phone.as_deref(), Some(phone.as_str()));
    assert!(paired.status.authenticated);

    let unpaired = state.registry.get("12345").unwrap();
    assert!(!unpaired.status.authenticated);

    // Paired sessions reconnect in the background.
    for _ in 0..200 {
        if state.registry.status("9999999999").unwrap().connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(state.registry.status("9999999999").unwrap().connected);
    assert!(!state.registry.status("12345").unwrap().connected);
}
