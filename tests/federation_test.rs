//! Federation behaviour over real UDP sockets on loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use trunkline::agi::AgiSession;
use trunkline::application::{Application, IvrApplication};
use trunkline::config::{IvrConfig, OutgoingIvrConfig, SmsConfig, SmsSendConfig};
use trunkline::domain::{NodeId, ResourceKind};
use trunkline::federation::{
    FederationNode, HandlerClass, IvrEvent, NodeConfig, NodeError, Tuple, TupleTemplate,
    classify_ivr_handler,
};
use trunkline::federation::handle::NodeHandle;

const TEST_RPC_TIMEOUT: Duration = Duration::from_millis(250);

fn outgoing_ivr() -> Option<IvrConfig> {
    Some(IvrConfig {
        fastagi_port: 0,
        default_tts: "flite".into(),
        incoming_enabled: false,
        outgoing: Some(OutgoingIvrConfig {
            channels: vec!["SIP/line1".into()],
            gateway_address: None,
            local_int_code: None,
            int_dialout: None,
            prefix: None,
            internal_extension_length: None,
            host: "pbx.example.net".into(),
            port: 5038,
            username: "ast".into(),
            secret: "hunter2".into(),
            speech_server_address: "127.0.0.1".into(),
            speech_server_port: 9000,
        }),
    })
}

fn handler_only_ivr() -> Option<IvrConfig> {
    Some(IvrConfig {
        fastagi_port: 0,
        default_tts: "flite".into(),
        incoming_enabled: false,
        outgoing: None,
    })
}

async fn make_node(ivr: Option<IvrConfig>, sms: Option<SmsConfig>) -> Arc<FederationNode> {
    FederationNode::create(NodeConfig {
        udp_port: 0,
        ivr,
        sms,
        rpc_timeout: Some(TEST_RPC_TIMEOUT),
    })
    .await
    .expect("node binds")
}

fn loopback_addr(node: &FederationNode) -> SocketAddr {
    let port = node.udp_addr().expect("bound").port();
    format!("127.0.0.1:{port}").parse().expect("valid addr")
}

/// Handler stub that never touches the session; used to advertise an IVR
/// handler so `handleEvent` succeeds.
struct IdleHandler;

impl IvrApplication for IdleHandler {
    fn handle_ivr(&self, _session: AgiSession, _node: &NodeHandle) {}
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_seed_list_joins_immediately() {
    let node = make_node(None, None).await;
    node.join(&[]).await.unwrap();
    assert!(node.contacts().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn join_replicates_seed_tuples() {
    let seed = make_node(outgoing_ivr(), None).await.tap_join().await;
    let joiner = make_node(None, None).await;
    joiner.join(&[loopback_addr(&seed)]).await.unwrap();

    // The seed's identity was learned from the reply envelope.
    assert!(joiner.contacts().contains(seed.id()));

    // The seed's owned resource tuple is now locally visible with the
    // seed's id as owner.
    let template = TupleTemplate::any_resource(ResourceKind::Ivr);
    let (tuple, owner) = joiner.store().find_tuple(&template).expect("replicated");
    assert_eq!(owner, seed.id());
    assert_eq!(tuple.owner(), seed.id());

    // Taking it locally removes it from this node's view only.
    assert!(joiner.store().take(&template).is_some());
    assert!(joiner.store().find_tuple(&template).is_none());
    assert!(seed.store().find_tuple(&template).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn join_fails_when_no_seed_is_reachable() {
    // A socket that swallows datagrams without answering.
    let dead = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();

    let node = make_node(None, None).await;
    match node.join(&[dead_addr]).await {
        Err(NodeError::NoSeedsReachable) => {}
        other => panic!("expected NoSeedsReachable, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn join_fails_when_only_some_seeds_respond() {
    let live = make_node(None, None).await.tap_join().await;
    let dead = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();

    let node = make_node(None, None).await;
    match node.join(&[loopback_addr(&live), dead_addr]).await {
        Err(NodeError::NotAllContactsResponded) => {}
        other => panic!("expected NotAllContactsResponded, got {other:?}"),
    }
    // The live seed was still learned.
    assert!(node.contacts().contains(live.id()));
}

#[tokio::test(flavor = "multi_thread")]
async fn claim_is_exclusive_until_released() {
    let owner = make_node(outgoing_ivr(), None).await.tap_join().await;
    let claimer = make_node(None, None).await;
    claimer.join(&[loopback_addr(&owner)]).await.unwrap();

    // First claim takes the replica and fetches credentials from the owner.
    let claim = claimer
        .claim_resource(ResourceKind::Ivr, false, true)
        .await
        .unwrap()
        .expect("resource available");
    assert_eq!(claim.original_owner(), owner.id());
    assert_eq!(claimer.claimed_resources(), 1);
    match &claim.info {
        trunkline::federation::ResourceInfo::Ivr(info) => {
            assert_eq!(info.channel, "SIP/line1");
            assert_eq!(info.username, "ast");
        }
        other => panic!("expected ivr credentials, got {other:?}"),
    }

    // A concurrent claim against the same pool view fails.
    let second = claimer
        .claim_resource(ResourceKind::Ivr, false, true)
        .await
        .unwrap();
    assert!(second.is_none());

    // Release re-publishes under the original owner; claiming succeeds
    // again and attribution is preserved.
    claimer.release_resource(&claim);
    assert_eq!(claimer.claimed_resources(), 0);
    let reclaimed = claimer
        .claim_resource(ResourceKind::Ivr, false, true)
        .await
        .unwrap()
        .expect("released resource is claimable");
    assert_eq!(reclaimed.original_owner(), owner.id());
    claimer.release_resource(&reclaimed);
}

#[tokio::test(flavor = "multi_thread")]
async fn claim_rpc_timeout_consumes_the_tuple_and_prunes_the_contact() {
    let owner = make_node(outgoing_ivr(), None).await.tap_join().await;
    let claimer = make_node(None, None).await;
    claimer.join(&[loopback_addr(&owner)]).await.unwrap();

    owner.halt();
    match claimer.claim_resource(ResourceKind::Ivr, false, true).await {
        Err(NodeError::ClaimLost { contact }) => assert_eq!(contact, owner.id()),
        other => panic!("expected ClaimLost, got {other:?}"),
    }
    // The dead contact is gone, the tuple is consumed, and nothing was
    // counted as claimed.
    assert!(!claimer.contacts().contains(owner.id()));
    assert!(
        claimer
            .store()
            .find_tuple(&TupleTemplate::any_resource(ResourceKind::Ivr))
            .is_none()
    );
    assert_eq!(claimer.claimed_resources(), 0);
}

#[test]
fn handler_priority_classes_order_correctly() {
    let owner = NodeId::generate();
    let h1 = Tuple::ivr_handler(owner, "SIP/100", "2772001");
    let h2 = Tuple::ivr_handler(owner, "SIP/100", "");
    let h3 = Tuple::ivr_handler(owner, "", "2772001");
    let h4 = Tuple::ivr_handler(owner, "", "");

    assert_eq!(
        classify_ivr_handler(&h1, "SIP/100", "2772001"),
        Some(HandlerClass::Specific)
    );
    assert_eq!(
        classify_ivr_handler(&h2, "SIP/100", "2772001"),
        Some(HandlerClass::ChannelBound)
    );
    assert_eq!(
        classify_ivr_handler(&h3, "SIP/100", "2772001"),
        Some(HandlerClass::CallerBound)
    );
    assert_eq!(
        classify_ivr_handler(&h4, "SIP/100", "2772001"),
        Some(HandlerClass::Generic)
    );
    assert!(HandlerClass::Specific < HandlerClass::ChannelBound);
    assert!(HandlerClass::ChannelBound < HandlerClass::CallerBound);
    assert!(HandlerClass::CallerBound < HandlerClass::Generic);

    // A mismatched filter excludes the handler outright.
    assert_eq!(classify_ivr_handler(&h1, "SIP/999", "2772001"), None);
    assert_eq!(classify_ivr_handler(&h3, "SIP/100", "0000"), None);
    // Resource tuples are never handler candidates.
    assert_eq!(
        classify_ivr_handler(
            &Tuple::resource(ResourceKind::Ivr, owner),
            "SIP/100",
            "2772001"
        ),
        None
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn dead_handler_node_is_pruned_and_routing_falls_back() {
    use trunkline::application::IvrHandlerFilters;

    // The specific handler outranks the generic one, so routing tries it
    // first; once its node stops answering it is pruned and the generic
    // handler wins.
    let specific = make_node(handler_only_ivr(), None).await.tap_join().await;
    specific.run_application(Application::ivr_filtered(
        Arc::new(IdleHandler),
        IvrHandlerFilters {
            channel: "SIP/100".into(),
            caller_id: "2772001".into(),
        },
    ));
    let generic = make_node(handler_only_ivr(), None).await.tap_join().await;
    generic.run_application(Application::ivr(Arc::new(IdleHandler)));

    let router = make_node(None, None).await;
    router
        .join(&[loopback_addr(&specific), loopback_addr(&generic)])
        .await
        .unwrap();

    specific.halt();

    let event = IvrEvent {
        handler_id: trunkline::domain::HandlerId::mint("incoming:SIP/100"),
        channel: "SIP/100".into(),
        caller_id: "2772001".into(),
        session_id: "1700000000.7".into(),
    };
    let routed = router.notify_ivr_event(event).await.expect("fallback found");
    let generic_port = generic.agi_server().expect("agi server").port();
    assert_eq!(routed.1, generic_port);

    // The dead node's contact and handler tuple are gone from the local
    // view; the live handler remains.
    assert!(!router.contacts().contains(specific.id()));
    let remaining = router.store().find_all(&TupleTemplate::any_ivr_handler());
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].0.owner(), generic.id());
}

#[tokio::test(flavor = "multi_thread")]
async fn no_responsive_handler_yields_no_route() {
    let router = make_node(None, None).await.tap_join().await;
    let event = IvrEvent {
        handler_id: trunkline::domain::HandlerId::mint("incoming:SIP/1"),
        channel: "SIP/1".into(),
        caller_id: "123".into(),
        session_id: "1700000000.8".into(),
    };
    assert!(router.notify_ivr_event(event).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_broadcast_removes_the_contact_at_peers() {
    let leaver = make_node(None, None).await.tap_join().await;
    let peer = make_node(None, None).await;
    peer.join(&[loopback_addr(&leaver)]).await.unwrap();
    // The leaver learned the peer from its inbound join RPC.
    assert!(leaver.contacts().contains(peer.id()));

    leaver.shutdown().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!peer.contacts().contains(leaver.id()));
}

#[tokio::test(flavor = "multi_thread")]
async fn sms_resource_claims_are_shared_reads() {
    let sms = SmsConfig {
        receive: None,
        send: Some(SmsSendConfig {
            host: "127.0.0.1".into(),
            port: 13013,
            username: "kannel".into(),
            password: "kannel".into(),
        }),
    };
    let gateway = make_node(None, Some(sms)).await.tap_join().await;
    let reader = make_node(None, None).await;
    reader.join(&[loopback_addr(&gateway)]).await.unwrap();

    // Non-exclusive reads leave the tuple in place and count nothing.
    let first = reader
        .claim_resource(ResourceKind::Sms, false, false)
        .await
        .unwrap()
        .expect("gateway advertised");
    let second = reader
        .claim_resource(ResourceKind::Sms, false, false)
        .await
        .unwrap();
    assert!(second.is_some());
    assert_eq!(reader.claimed_resources(), 0);

    match &first.info {
        trunkline::federation::ResourceInfo::Sms(info) => {
            // The loopback gateway address is rewritten to the owning
            // contact's address.
            assert_eq!(info.host, "127.0.0.1");
            assert_eq!(info.port, 13013);
            assert_eq!(info.username, "kannel");
        }
        other => panic!("expected sms credentials, got {other:?}"),
    }
}

/// Joins with no seeds, for nodes acting as seeds themselves.
trait TapJoin {
    async fn tap_join(self) -> Self;
}

impl TapJoin for Arc<FederationNode> {
    async fn tap_join(self) -> Self {
        self.join(&[]).await.expect("seedless join succeeds");
        self
    }
}
