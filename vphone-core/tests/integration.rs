//! Integration tests: a conference manager on a loopback signaling stack,
//! driven end to end by a VRCL client over real TCP on localhost.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use vphone_core::call::RemoteInfo;
use vphone_core::vrcl::XmlElement;
use vphone_core::{
    ApiVersion, Blake3KeyDerivation, CallState, ConferenceConfig, ConferenceManager,
    ConferenceRemote, Context, DialRequest, LoggingPlatform, LoopbackConfig, LoopbackSipStack,
    MemoryPropertyStore, SimulatedVideoInput, VideoInput, VpError, VrclClient, VrclClientConfig,
    VrclNotifier, VrclServer, VrclServerConfig,
};

const SECRET: &str = "integration secret";

// ── Helpers ──────────────────────────────────────────────────────

struct Endpoint {
    manager: Arc<ConferenceManager>,
    loopback: Arc<LoopbackSipStack>,
    video: Arc<SimulatedVideoInput>,
    server: VrclServer,
    _notifier: VrclNotifier,
    addr: SocketAddr,
}

impl Endpoint {
    fn start(loopback: LoopbackConfig) -> Self {
        let loopback = Arc::new(LoopbackSipStack::new(LoopbackConfig {
            answer_delay: Duration::from_millis(20),
            ..loopback
        }));
        loopback.start();
        let video = Arc::new(SimulatedVideoInput::new());
        let context = Context::new(
            LoggingPlatform::new(),
            loopback.clone(),
            Arc::new(MemoryPropertyStore::new()),
        )
        .with_video(video.clone());

        let manager = Arc::new(ConferenceManager::new(
            &context,
            ConferenceConfig {
                local_name: "Front Desk".into(),
                ..ConferenceConfig::default()
            },
        ));
        manager.start().unwrap();

        let server = VrclServer::new(
            VrclServerConfig {
                port: 0,
                bind_v4: Ipv4Addr::LOCALHOST,
                ipv6: false,
                ..VrclServerConfig::default()
            },
            Arc::new(Blake3KeyDerivation::new(SECRET)),
            Arc::new(ConferenceRemote::new(Arc::clone(&manager), &context)),
        );
        let addr = server.start().unwrap()[0];
        let video_input: Arc<dyn VideoInput> = video.clone();
        let notifier = VrclNotifier::attach(server.notifier(), &manager, Some(&video_input));

        Self {
            manager,
            loopback,
            video,
            server,
            _notifier: notifier,
            addr,
        }
    }

    async fn client(&self) -> VrclClient {
        self.client_with(VrclClientConfig::new(Arc::new(Blake3KeyDerivation::new(SECRET))))
            .await
            .unwrap()
    }

    async fn client_with(&self, config: VrclClientConfig) -> Result<VrclClient, VpError> {
        VrclClient::connect(self.addr, config).await
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.server.stop();
        self.manager.shutdown();
        self.loopback.stop();
    }
}

/// Next notification called `name`, skipping any others.
async fn expect_notification(client: &mut VrclClient, name: &str) -> XmlElement {
    let wait = async {
        loop {
            let element = client.next_notification().await.expect("connection closed");
            if element.name == name {
                return element;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("no {name} notification"))
}

// ── Call control ─────────────────────────────────────────────────

#[tokio::test]
async fn test_hang_up_reports_terminated_with_code() {
    let endpoint = Endpoint::start(LoopbackConfig::default());
    let mut client = endpoint.client().await;

    let index = client.dial(DialRequest::new("5551234")).await.unwrap();
    let connected = expect_notification(&mut client, "CallConnected").await;
    assert_eq!(connected.attr("call"), Some(index.to_string().as_str()));

    client.hang_up(None).await.unwrap();
    let terminated = expect_notification(&mut client, "CallTerminated").await;
    assert_eq!(terminated.attr("call"), Some(index.to_string().as_str()));
    assert_eq!(terminated.text(), "0");
}

#[tokio::test]
async fn test_second_dial_is_refused_at_call_limit() {
    let endpoint = Endpoint::start(LoopbackConfig::default());
    let client = endpoint.client().await;

    client.dial(DialRequest::new("5551234")).await.unwrap();
    match client.dial(DialRequest::new("5550000")).await {
        Err(VpError::CommandFailed { command, reason }) => {
            assert_eq!(command, "CallDial");
            assert_eq!(reason, "TooManyCalls");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(endpoint.manager.calls().len(), 1);
}

#[tokio::test]
async fn test_transfer_of_untransferable_call_fails() {
    let endpoint = Endpoint::start(LoopbackConfig {
        transferable: false,
        ..LoopbackConfig::default()
    });
    let mut client = endpoint.client().await;

    client.dial(DialRequest::new("5551234")).await.unwrap();
    expect_notification(&mut client, "CallConnected").await;

    match client.transfer(None, "5559999").await {
        Err(VpError::CommandFailed { command, reason }) => {
            assert_eq!(command, "CallTransfer");
            assert_eq!(reason, "NotTransferable");
        }
        other => panic!("unexpected {other:?}"),
    }
    let call = endpoint.manager.head_call().unwrap();
    assert_eq!(call.state(), CallState::Connected);
}

#[tokio::test]
async fn test_incoming_call_is_announced_and_answered() {
    let endpoint = Endpoint::start(LoopbackConfig::default());
    let mut client = endpoint.client().await;

    endpoint.loopback.ring_in(RemoteInfo {
        display_name: "Ada".into(),
        phone_number: "5550001".into(),
        ..RemoteInfo::default()
    });
    let incoming = expect_notification(&mut client, "CallIncoming").await;
    assert_eq!(incoming.attr("name"), Some("Ada"));
    assert_eq!(incoming.attr("number"), Some("5550001"));

    client.answer(None).await.unwrap();
    expect_notification(&mut client, "CallConnected").await;
}

// ── Session behaviour ────────────────────────────────────────────

#[tokio::test]
async fn test_is_alive_leaves_calls_untouched() {
    let endpoint = Endpoint::start(LoopbackConfig::default());
    let client = endpoint.client().await;

    client.is_alive().await.unwrap();
    assert!(endpoint.manager.calls().is_empty());
    assert!(endpoint.server.is_client_authenticated());
}

#[tokio::test]
async fn test_status_and_settings_over_the_wire() {
    let endpoint = Endpoint::start(LoopbackConfig::default());
    let client = endpoint.client().await;

    let status = client.status().await.unwrap();
    assert_eq!(status.attr("state"), Some("Idle"));
    assert_eq!(status.attr("maxCalls"), Some("1"));
    assert_eq!(status.attr("name"), Some("Front Desk"));

    client.setting_set("MaxCalls", "2").await.unwrap();
    assert_eq!(client.setting_get("MaxCalls").await.unwrap(), "2");
    assert_eq!(endpoint.manager.max_calls_get(), 2);
}

#[tokio::test]
async fn test_mismatched_secret_is_disconnected() {
    let endpoint = Endpoint::start(LoopbackConfig::default());
    let config = VrclClientConfig::new(Arc::new(Blake3KeyDerivation::new("wrong secret")));

    let result = endpoint.client_with(config).await;
    assert!(matches!(result, Err(VpError::Authentication(_))));
    assert!(!endpoint.server.is_client_authenticated());
}

#[tokio::test]
async fn test_second_client_is_refused() {
    let endpoint = Endpoint::start(LoopbackConfig::default());
    let _first = endpoint.client().await;

    let second = endpoint
        .client_with(VrclClientConfig::new(Arc::new(Blake3KeyDerivation::new(SECRET))))
        .await;
    assert!(second.is_err());
    assert_eq!(endpoint.server.refused_connections(), 1);
}

#[tokio::test]
async fn test_notifications_respect_negotiated_version() {
    let endpoint = Endpoint::start(LoopbackConfig::default());
    let mut config = VrclClientConfig::new(Arc::new(Blake3KeyDerivation::new(SECRET)));
    config.api_version = ApiVersion::BASELINE;
    let mut old = endpoint.client_with(config).await.unwrap();
    assert_eq!(old.negotiated_version(), ApiVersion::BASELINE);

    endpoint.video.privacy_set(true).unwrap();
    // The server answers in order, so anything it sent is already queued.
    old.is_alive().await.unwrap();
    assert!(old.try_notification().is_none());
    old.close().await;

    let mut current = wait_for_slot(&endpoint).await;
    endpoint.video.privacy_set(false).unwrap();
    let privacy = expect_notification(&mut current, "VideoPrivacy").await;
    assert_eq!(privacy.text(), "Off");
}

/// Reconnect once the server has noticed the previous client left.
async fn wait_for_slot(endpoint: &Endpoint) -> VrclClient {
    for _ in 0..100 {
        if !endpoint.server.is_client_connected() {
            return endpoint.client().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server kept the previous client");
}
