//! Channel manager: bonding, placement and failover over in-memory servers.

mod common;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use smbmux_transport::interface::capability as if_cap;
use smbmux_transport::negotiate::capability;
use smbmux_transport::protocol::command;
use smbmux_transport::{
    ChannelBindingPolicy, ChannelManager, ChannelState, EngineState, LoadBalancing, MultiChannelStatus,
    NetworkInterfaceInfo, OutgoingRequest, StaticInterfaces, StaticNegotiator, TransportConfig,
    TransportEngine, TransportError,
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn bonding_config(max_channels: usize) -> TransportConfig {
    TransportConfig {
        multi_channel_enabled: true,
        max_channels,
        load_balancing: LoadBalancing::RoundRobin,
        ..TransportConfig::default()
    }
}

struct Setup {
    manager: ChannelManager,
    factory: Arc<MockFactory>,
    _primary_server: ScriptedServer,
}

async fn setup(config: TransportConfig, capabilities: u32, factory: MockFactory) -> Setup {
    let (client, primary_server) = duplex_pair(addr(CLIENT), addr(SERVER));
    let primary = TransportEngine::builder(addr(SERVER))
        .name("primary")
        .config(config.clone())
        .connector(Arc::new(QueueConnector::new(vec![client])))
        .negotiator(Arc::new(StaticNegotiator::new(session(16, capabilities))))
        .build();
    primary.connect(Duration::from_secs(1)).await.unwrap();

    let local = StaticInterfaces(vec![
        NetworkInterfaceInfo::new(ip("10.0.0.2"), 1_000_000_000),
        NetworkInterfaceInfo::new(ip("10.0.1.2"), 10_000_000_000).with_capabilities(if_cap::RSS),
    ]);
    let factory = Arc::new(factory);
    let manager = ChannelManager::new(primary, factory.clone(), Arc::new(local), config);
    manager.set_session_key(Bytes::from_static(b"session-key"));
    Setup { manager, factory, _primary_server: primary_server }
}

fn server_interfaces() -> Vec<NetworkInterfaceInfo> {
    vec![
        NetworkInterfaceInfo::new(ip("10.0.0.1"), 1_000_000_000),
        NetworkInterfaceInfo::new(ip("10.0.1.1"), 10_000_000_000).with_capabilities(if_cap::RSS),
    ]
}

#[tokio::test]
async fn test_disabled_keeps_primary_only() {
    let s = setup(TransportConfig::default(), capability::MULTI_CHANNEL, MockFactory::new(server_interfaces())).await;
    assert_eq!(s.manager.initialize().await.unwrap(), MultiChannelStatus::Disabled);
    assert_eq!(s.manager.channels().len(), 1);
    assert!(s.manager.select_channel().unwrap().is_primary());
    // Second call reports the same outcome.
    assert_eq!(s.manager.initialize().await.unwrap(), MultiChannelStatus::Disabled);
    assert!(matches!(
        s.manager.adjust_channel_count(2).await,
        Err(TransportError::MultiChannelDisabled)
    ));
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_server_without_multichannel() {
    let s = setup(bonding_config(4), 0, MockFactory::new(server_interfaces())).await;
    assert_eq!(s.manager.initialize().await.unwrap(), MultiChannelStatus::NotSupported);
    assert_eq!(s.manager.channels().len(), 1);
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_bonds_best_pairs_up_to_max() {
    let s = setup(bonding_config(3), capability::MULTI_CHANNEL, MockFactory::new(server_interfaces())).await;
    assert_eq!(
        s.manager.initialize().await.unwrap(),
        MultiChannelStatus::Active { channels: 3 }
    );

    let channels = s.manager.channels();
    assert!(channels[0].is_primary());
    // The 10G RSS pair scores highest.
    assert_eq!(channels[1].local_interface().address, ip("10.0.1.2"));
    assert_eq!(channels[1].remote_interface().address, ip("10.0.1.1"));
    assert!(channels[1].binding_hash().is_some());
    assert_ne!(channels[1].binding_hash(), channels[2].binding_hash());
    assert!(channels.iter().all(|c| c.state() == ChannelState::Healthy));
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_channel_fails_pending_and_leaves_rotation() {
    let s = setup(bonding_config(2), capability::MULTI_CHANNEL, MockFactory::new(server_interfaces())).await;
    s.manager.initialize().await.unwrap();
    let channels = s.manager.channels();
    let (b, a) = (channels[0].clone(), channels[1].clone());
    let a_server = s.factory.server_for(a.remote_interface().address).unwrap();

    let callers: Vec<_> = (0..2)
        .map(|_| {
            let engine = a.engine().clone();
            tokio::spawn(async move {
                engine
                    .send_and_receive(OutgoingRequest::new(command::ECHO, Bytes::new()), Duration::from_secs(5))
                    .await
            })
        })
        .collect();
    a_server.next_request().await;
    a_server.next_request().await;
    assert_eq!(a.pending_count(), 2);

    s.manager.handle_channel_failure(&a, TransportError::ConnectionReset);
    assert_eq!(a.state(), ChannelState::Failed);
    for _ in 0..4 {
        assert_eq!(s.manager.select_channel().unwrap().id(), b.id());
    }

    for caller in callers {
        assert!(caller.await.unwrap().is_err());
    }
    assert_eq!(s.manager.metrics().snapshot().channel_failovers, 1);
    // A second report of the same failure is ignored.
    s.manager.handle_channel_failure(&a, TransportError::ConnectionReset);
    assert_eq!(s.manager.metrics().snapshot().channel_failovers, 1);
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_connection_loss_detected_without_traffic() {
    let s = setup(bonding_config(2), capability::MULTI_CHANNEL, MockFactory::new(server_interfaces())).await;
    s.manager.initialize().await.unwrap();
    let a = s.manager.channels()[1].clone();
    let a_server = s.factory.server_for(a.remote_interface().address).unwrap();

    a_server.close().await;
    eventually(|| a.state() == ChannelState::Failed).await;
    assert!(s.manager.select_channel().unwrap().is_primary());
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_no_available_channel_when_all_failed() {
    let s = setup(TransportConfig::default(), 0, MockFactory::new(Vec::new())).await;
    s.manager.initialize().await.unwrap();
    let primary = s.manager.channels()[0].clone();
    s.manager.handle_channel_failure(&primary, TransportError::ConnectionReset);
    assert!(matches!(s.manager.select_channel(), Err(TransportError::NoAvailableChannel)));
    assert!(matches!(
        s.manager
            .send_and_receive(OutgoingRequest::new(command::ECHO, Bytes::new()), Duration::from_secs(1))
            .await,
        Err(TransportError::NoAvailableChannel)
    ));
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_send_retries_on_other_channel_when_not_connected() {
    let mut factory = MockFactory::new(server_interfaces());
    factory.auto_echo = true;
    let s = setup(bonding_config(2), capability::MULTI_CHANNEL, factory).await;
    s.manager.initialize().await.unwrap();

    // The primary drops quietly; the balancer has not noticed yet.
    let primary = s.manager.channels()[0].clone();
    primary.engine().disconnect(true).await.unwrap();

    for _ in 0..2 {
        let response = s
            .manager
            .send_and_receive(OutgoingRequest::new(command::ECHO, Bytes::from_static(b"x")), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(response.is_success());
    }
    assert_ne!(primary.state(), ChannelState::Healthy);
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_required_binding_failure_fails_initialize() {
    let mut factory = MockFactory::new(server_interfaces());
    factory.fail_bind = true;
    let config = TransportConfig { channel_binding: ChannelBindingPolicy::Required, ..bonding_config(3) };
    let s = setup(config, capability::MULTI_CHANNEL, factory).await;
    assert!(matches!(
        s.manager.initialize().await,
        Err(TransportError::ChannelBinding { .. })
    ));
    assert_eq!(s.manager.channels().len(), 1);
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_preferred_binding_failure_skips_channel() {
    let mut factory = MockFactory::new(server_interfaces());
    factory.fail_bind = true;
    let s = setup(bonding_config(3), capability::MULTI_CHANNEL, factory).await;
    assert_eq!(
        s.manager.initialize().await.unwrap(),
        MultiChannelStatus::Active { channels: 1 }
    );
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_adjust_channel_count_grows_and_shrinks() {
    let mut factory = MockFactory::new(server_interfaces());
    factory.auto_echo = true;
    let s = setup(bonding_config(4), capability::MULTI_CHANNEL, factory).await;
    s.manager.initialize().await.unwrap();
    assert_eq!(s.manager.channels().len(), 4);

    assert_eq!(s.manager.adjust_channel_count(2).await.unwrap(), 2);
    assert!(s.manager.channels().iter().any(|c| c.is_primary()));
    assert_eq!(s.manager.adjust_channel_count(3).await.unwrap(), 3);
    assert_eq!(s.manager.adjust_channel_count(10).await.unwrap(), 4);
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_health_check_degrades_failing_channel() {
    let s = setup(bonding_config(2), capability::MULTI_CHANNEL, MockFactory::new(server_interfaces())).await;
    s.manager.initialize().await.unwrap();
    let a = s.manager.channels()[1].clone();
    for _ in 0..8 {
        a.health().record_success(Duration::from_millis(1));
    }
    for _ in 0..3 {
        a.health().record_failure();
    }
    assert_eq!(a.refresh_health(), ChannelState::Degraded);
    for _ in 0..10 {
        assert!(s.manager.select_channel().unwrap().is_primary());
    }
    s.manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_tears_down() {
    let s = setup(bonding_config(2), capability::MULTI_CHANNEL, MockFactory::new(server_interfaces())).await;
    s.manager.initialize().await.unwrap();
    let channels = s.manager.channels();

    tokio::join!(s.manager.shutdown(), s.manager.shutdown());
    s.manager.shutdown().await;

    assert!(s.manager.channels().is_empty());
    assert!(channels.iter().all(|c| c.state() == ChannelState::Removed));
    eventually(|| channels.iter().all(|c| c.engine().state() == EngineState::NotConnected)).await;
    assert!(matches!(s.manager.select_channel(), Err(TransportError::NoAvailableChannel)));
}
