//! The same pipeline against a ledger node reached over TCP, with two
//! independent client processes simulated by two connections.

use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread,
    time::Duration,
};

use tally_deploy::{
    abi::{Bytes32, Value},
    artifact,
    client::{ClientError, LedgerClient, LocalLedger, Mining},
    deploy::{DeployError, Deployer},
    descriptor::DescriptorStore,
    identity::Identity,
    ledger::{LedgerError, LedgerSettings},
    proxy::{self, BindOptions, ProxyError},
    rpc::{self, RpcClient},
    tally::TallyBinding,
};

const VOTING: &str = include_str!("../demos/Voting.tally");

fn spawn_node() -> SocketAddr {
    let ledger: Arc<dyn LedgerClient> = Arc::new(LocalLedger::open(
        &LedgerSettings::default(),
        Mining::Interval(Duration::from_millis(5)),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || rpc::serve(listener, ledger));
    addr
}

fn id(name: &str) -> Bytes32 {
    Bytes32::from_name(name).unwrap()
}

fn options() -> BindOptions {
    BindOptions {
        poll_interval: Duration::from_millis(5),
        ..BindOptions::default()
    }
}

#[test]
fn deploy_in_one_client_vote_from_another() {
    let addr = spawn_node();
    let dir = tempfile::tempdir().unwrap();
    let store = DescriptorStore::new(dir.path().join("contract.json"));

    let deployer_client: Arc<dyn LedgerClient> = Arc::new(RpcClient::connect(addr).unwrap());
    assert_eq!(deployer_client.accounts().unwrap().len(), 10);
    let artifact = artifact::produce(VOTING).unwrap();
    let descriptor = Deployer::new(deployer_client.clone(), Duration::from_millis(5))
        .deploy(
            &artifact,
            &[Value::Bytes32List(vec![id("Rama"), id("Nick"), id("Claudius")])],
            &Identity::dev(8545, 0),
            4_700_000,
        )
        .unwrap();
    store.save(&descriptor).unwrap();
    deployer_client.close().unwrap();

    let client: Arc<dyn LedgerClient> = Arc::new(RpcClient::connect(addr).unwrap());
    let reloaded = DescriptorStore::new(store.path()).load().unwrap();
    let tally = TallyBinding::new(proxy::bind(&reloaded, client.clone(), options()).unwrap());
    assert_eq!(tally.total_votes_for(&id("Rama")).unwrap(), 0);
    let handle = tally.vote(&id("Rama"), &Identity::dev(8545, 4)).unwrap();
    assert!(handle.wait().is_confirmed());
    assert_eq!(tally.total_votes_for(&id("Rama")).unwrap(), 1);
    assert!(matches!(
        tally.total_votes_for(&id("Unknown")),
        Err(ProxyError::UnknownCandidate(_))
    ));
    tally.proxy().close();
    client.close().unwrap();
}

#[test]
fn gas_shortfall_over_rpc() {
    let addr = spawn_node();
    let client: Arc<dyn LedgerClient> = Arc::new(RpcClient::connect(addr).unwrap());
    let artifact = artifact::produce(VOTING).unwrap();
    let err = Deployer::new(client, Duration::from_millis(5))
        .deploy(
            &artifact,
            &[Value::Bytes32List(vec![id("Rama")])],
            &Identity::dev(8545, 0),
            21_000,
        )
        .unwrap_err();
    assert!(matches!(err, DeployError::ResourceLimitExceeded { .. }));
}

#[test]
fn unknown_transactions_surface_as_ledger_errors() {
    let addr = spawn_node();
    let client = RpcClient::connect(addr).unwrap();
    assert!(matches!(
        client.status("0xdeadbeef"),
        Err(ClientError::Ledger(LedgerError::UnknownTransaction(_)))
    ));
}
